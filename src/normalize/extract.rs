//! Best-effort field extraction from webhook payloads.
//!
//! Producers emit several incompatible shapes for the same event, so the
//! extractor walks two ordered tables of field paths (one for the
//! destination, one for the body) and keeps the first hit of each.
//! Supporting a new producer shape means adding a row to a table.

use serde_json::Value;

use super::{NormalizedMessage, ValidationError, BODY_FIELD, DESTINATION_FIELD};

/// One step of a [`FieldPath`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Object member lookup.
    Key(&'static str),
    /// Array element lookup.
    Index(usize),
}

use Segment::{Index, Key};

/// A path from the payload root to a candidate value.
pub type FieldPath = &'static [Segment];

/// Wrapper objects some producers put around the actual event, in lookup order.
pub const ENVELOPE_KEYS: &[&str] = &["payload", "data"];

/// Destination candidates in precedence order.
pub const DESTINATION_PATHS: &[FieldPath] = &[
    &[Key("phone")],
    &[Key("to")],
    &[Key("number")],
    &[Key("contact"), Key("phone_number")],
    &[Key("conversation"), Key("contact"), Key("phone_number")],
    &[
        Key("conversation"),
        Key("contact_inbox"),
        Key("contact"),
        Key("phone_number"),
    ],
    &[Key("sender"), Key("phone_number")],
    &[Key("message"), Key("sender"), Key("phone_number")],
    &[Key("meta"), Key("sender"), Key("phone_number")],
    &[
        Key("conversation"),
        Key("meta"),
        Key("sender"),
        Key("phone_number"),
    ],
];

/// Body candidates in precedence order.
pub const BODY_PATHS: &[FieldPath] = &[
    &[Key("message")],
    &[Key("text")],
    &[Key("content")],
    &[Key("message"), Key("content")],
    &[Key("messages"), Index(0), Key("content")],
    &[
        Key("conversation"),
        Key("messages"),
        Index(0),
        Key("content"),
    ],
];

/// Result of probing a payload. Either side may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedFields {
    /// First destination candidate that matched.
    pub destination: Option<String>,
    /// First body candidate that matched.
    pub body: Option<String>,
}

impl ExtractedFields {
    /// Names of the fields that did not match any candidate.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.destination.is_none() {
            missing.push(DESTINATION_FIELD);
        }
        if self.body.is_none() {
            missing.push(BODY_FIELD);
        }
        missing
    }

    /// Require both fields.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MissingFields`] naming every absent field.
    pub fn into_message(self) -> Result<NormalizedMessage, ValidationError> {
        match (self.destination, self.body) {
            (Some(destination), Some(body)) => Ok(NormalizedMessage { destination, body }),
            (destination, body) => Err(ValidationError::MissingFields(
                Self { destination, body }.missing(),
            )),
        }
    }
}

/// Extract a destination and a body from an arbitrary webhook payload.
///
/// The two tables are evaluated independently; no merging happens across
/// candidates. A candidate matches when it resolves to a non-blank string or
/// to a number.
pub fn extract_fields(raw: &Value) -> ExtractedFields {
    let root = unwrap_envelope(raw);
    ExtractedFields {
        destination: first_hit(root, DESTINATION_PATHS),
        body: first_hit(root, BODY_PATHS),
    }
}

fn unwrap_envelope(raw: &Value) -> &Value {
    ENVELOPE_KEYS
        .iter()
        .filter_map(|key| raw.get(*key))
        .find(|inner| inner.is_object())
        .unwrap_or(raw)
}

fn first_hit(root: &Value, paths: &[FieldPath]) -> Option<String> {
    paths
        .iter()
        .find_map(|path| resolve(root, path).and_then(scalar_text))
}

fn resolve<'a>(root: &'a Value, path: &[Segment]) -> Option<&'a Value> {
    path.iter().try_fold(root, |value, segment| match segment {
        Key(key) => value.get(*key),
        Index(index) => value.get(*index),
    })
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
