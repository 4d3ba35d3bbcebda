//! Canonicalization of phone-like strings into WhatsApp JIDs.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Suffix of a user JID.
pub const USER_SUFFIX: &str = "@s.whatsapp.net";

/// Suffix of a group JID.
pub const GROUP_SUFFIX: &str = "@g.us";

/// Country code used when none is configured (Argentina).
pub const DEFAULT_COUNTRY_CODE: &str = "54";

/// Characters a dialable number may carry besides digits. Anything else
/// (letters, `@` with an unknown suffix, `#`, ...) is rejected.
static DIALABLE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[0-9+\s().\-/]*$").ok());

fn is_dialable(raw: &str) -> bool {
    DIALABLE.as_ref().is_some_and(|re| re.is_match(raw))
}

/// A regional dialing rule: mobile numbers carry an extra digit right after
/// the country code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MobilePrefixRule {
    /// Country code the rule applies to.
    pub country_code: &'static str,
    /// Digit inserted after the country code for mobile numbers.
    pub mobile_digit: char,
}

/// Supported regions. Argentina is the only one.
pub const MOBILE_PREFIX_RULES: &[MobilePrefixRule] = &[MobilePrefixRule {
    country_code: "54",
    mobile_digit: '9',
}];

/// How raw numbers are turned into JIDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPolicy {
    /// Country code prepended when the number lacks it. Digits only.
    pub country_code: String,
    /// Apply the region's [`MobilePrefixRule`], if one exists.
    pub enforce_mobile_prefix: bool,
}

impl Default for AddressPolicy {
    fn default() -> Self {
        Self {
            country_code: DEFAULT_COUNTRY_CODE.to_owned(),
            enforce_mobile_prefix: true,
        }
    }
}

impl AddressPolicy {
    fn mobile_rule(&self) -> Option<&'static MobilePrefixRule> {
        if !self.enforce_mobile_prefix {
            return None;
        }
        MOBILE_PREFIX_RULES
            .iter()
            .find(|rule| rule.country_code == self.country_code)
    }
}

/// Whether a JID addresses a user or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JidKind {
    /// `<digits>@s.whatsapp.net`
    User,
    /// `<id>@g.us`
    Group,
}

/// A protocol address in its final form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Jid(String);

impl Jid {
    /// The address as sent on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// User or group.
    pub fn kind(&self) -> JidKind {
        if self.0.ends_with(GROUP_SUFFIX) {
            JidKind::Group
        } else {
            JidKind::User
        }
    }

    /// Consume into the underlying string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Jid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Canonicalize a raw destination into a JID.
///
/// 1. Input already ending in [`USER_SUFFIX`] or [`GROUP_SUFFIX`] passes through.
/// 2. Punctuation is stripped; input with letters or a foreign `@` suffix is rejected.
/// 3. Leading zeros are dropped and the country code is prepended when missing.
/// 4. The region's mobile digit is inserted after the country code when the
///    policy enforces it and the number lacks it.
///
/// Returns `None` when no usable digits remain. Deterministic and
/// idempotent on its own output.
pub fn canonicalize(raw: &str, policy: &AddressPolicy) -> Option<Jid> {
    let raw = raw.trim();
    if raw.ends_with(USER_SUFFIX) || raw.ends_with(GROUP_SUFFIX) {
        return Some(Jid(raw.to_owned()));
    }
    if !is_dialable(raw) {
        return None;
    }

    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let national = digits.trim_start_matches('0');
    if national.is_empty() {
        return None;
    }

    let country_code = policy.country_code.as_str();
    let mut number = if national.starts_with(country_code) {
        national.to_owned()
    } else {
        format!("{country_code}{national}")
    };

    if let Some(rule) = policy.mobile_rule() {
        let rest = &number[country_code.len()..];
        if !rest.starts_with(rule.mobile_digit) {
            number = format!("{country_code}{}{rest}", rule.mobile_digit);
        }
    }

    Some(Jid(format!("{number}{USER_SUFFIX}")))
}
