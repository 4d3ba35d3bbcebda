//! Configuration loading and validation.
//!
//! Loads relay configuration from `./relay.toml` (or `$RELAY_CONFIG_PATH`).
//! A `.env` file in the working directory is loaded into the environment
//! first. Environment variables override file values; file values override
//! defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::normalize::address::{AddressPolicy, DEFAULT_COUNTRY_CODE};
use crate::relay::{is_valid_webhook_path, MediaLimits, FIXED_ROUTES};
use crate::whatsapp::client::DEFAULT_BRIDGE_URL;
use crate::whatsapp::SessionSettings;

/// Config file used when `$RELAY_CONFIG_PATH` is unset.
pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

/// Default request body cap (2 MiB).
const DEFAULT_BODY_LIMIT_BYTES: usize = 2 * 1024 * 1024;

// ── Top-level config ────────────────────────────────────────────

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// HTTP listener settings.
    pub server: ServerConfig,
    /// Destination canonicalization.
    pub address: AddressConfig,
    /// WhatsApp session settings.
    pub whatsapp: WhatsAppConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl RelayConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// `path` overrides the file location; otherwise `$RELAY_CONFIG_PATH` or
    /// `./relay.toml` is used. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting configuration is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env is normal.
        let _ = dotenvy::dotenv();

        let env = |key: &str| std::env::var(key).ok();
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path_with(env),
        };
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(env);
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("RELAY_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has wrong value types.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: RelayConfig = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests never touch the process environment.
    /// Unparsable values are ignored with a warning.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Server.
        if let Some(v) = env("BIND_ADDR") {
            self.server.bind = v;
        }
        override_parsed(&env, "PORT", &mut self.server.port);
        if let Some(v) = env("WEBHOOK_PATH") {
            self.server.webhook_path = v;
        }
        override_parsed(&env, "BODY_LIMIT_BYTES", &mut self.server.body_limit_bytes);
        override_parsed(&env, "MEDIA_TIMEOUT_SECS", &mut self.server.media_timeout_secs);
        override_parsed(&env, "MAX_MEDIA_BYTES", &mut self.server.max_media_bytes);

        // Address.
        if let Some(v) = env("DEFAULT_COUNTRY_CODE") {
            self.address.country_code = v.trim().to_owned();
        }
        override_bool(&env, "ENFORCE_MOBILE_PREFIX", &mut self.address.enforce_mobile_prefix);

        // WhatsApp.
        if let Some(v) = env("AUTH_DIR") {
            self.whatsapp.auth_dir = PathBuf::from(v);
        }
        if let Some(v) = env("BRIDGE_URL") {
            self.whatsapp.bridge_url = v;
        }
        override_parsed(&env, "SEND_TIMEOUT_SECS", &mut self.whatsapp.send_timeout_secs);
        override_parsed(&env, "RECONNECT_INITIAL_MS", &mut self.whatsapp.reconnect_initial_ms);
        override_parsed(&env, "RECONNECT_MAX_MS", &mut self.whatsapp.reconnect_max_ms);
        override_bool(&env, "PRINT_QR_IN_TERMINAL", &mut self.whatsapp.print_qr_terminal);

        // Logging.
        if let Some(v) = env("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = env("LOG_DIR") {
            self.log.dir = Some(PathBuf::from(v));
        }
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let cc = &self.address.country_code;
        if cc.is_empty() || !cc.chars().all(|c| c.is_ascii_digit()) {
            anyhow::bail!("address.country_code must be digits only, got {cc:?}");
        }
        let webhook_path = &self.server.webhook_path;
        if !is_valid_webhook_path(webhook_path) {
            anyhow::bail!(
                "server.webhook_path must start with '/', use only letters, digits and \
                 '/-_.~', and differ from {FIXED_ROUTES:?}; got {webhook_path:?}"
            );
        }
        if self.server.media_timeout_secs == 0 {
            anyhow::bail!("server.media_timeout_secs must be positive");
        }
        if self.whatsapp.send_timeout_secs == 0 {
            anyhow::bail!("whatsapp.send_timeout_secs must be positive");
        }
        if self.whatsapp.reconnect_initial_ms == 0 {
            anyhow::bail!("whatsapp.reconnect_initial_ms must be positive");
        }
        if self.whatsapp.reconnect_max_ms < self.whatsapp.reconnect_initial_ms {
            anyhow::bail!("whatsapp.reconnect_max_ms must be >= whatsapp.reconnect_initial_ms");
        }
        url::Url::parse(&self.whatsapp.bridge_url)
            .with_context(|| format!("invalid whatsapp.bridge_url {:?}", self.whatsapp.bridge_url))?;
        Ok(())
    }
}

fn override_parsed<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    target: &mut T,
) {
    if let Some(v) = env(var) {
        match v.trim().parse() {
            Ok(n) => *target = n,
            Err(_) => tracing::warn!(var, value = %v, "ignoring invalid env override"),
        }
    }
}

fn override_bool(env: &impl Fn(&str) -> Option<String>, var: &'static str, target: &mut bool) {
    if let Some(v) = env(var) {
        match parse_bool(&v) {
            Some(b) => *target = b,
            None => tracing::warn!(var, value = %v, "ignoring invalid env override"),
        }
    }
}

/// Parse the usual spellings of a boolean env value.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ── Server config ───────────────────────────────────────────────

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub bind: String,
    /// Listen port.
    pub port: u16,
    /// Path of the Chatwoot webhook route.
    pub webhook_path: String,
    /// Maximum request body size in bytes.
    pub body_limit_bytes: usize,
    /// Limit on each image download for `POST /send`, in seconds.
    pub media_timeout_secs: u64,
    /// Largest image accepted for `POST /send`, in bytes.
    pub max_media_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let media = MediaLimits::default();
        Self {
            bind: "0.0.0.0".to_owned(),
            port: 3000,
            webhook_path: "/webhooks/chatwoot".to_owned(),
            body_limit_bytes: DEFAULT_BODY_LIMIT_BYTES,
            media_timeout_secs: media.timeout.as_secs(),
            max_media_bytes: media.max_bytes,
        }
    }
}

impl ServerConfig {
    /// `bind:port` for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Bounds on images downloaded for direct sends.
    pub fn media_limits(&self) -> MediaLimits {
        MediaLimits {
            timeout: Duration::from_secs(self.media_timeout_secs),
            max_bytes: self.max_media_bytes,
        }
    }
}

// ── Address config ──────────────────────────────────────────────

/// Destination canonicalization settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AddressConfig {
    /// Country code prepended to numbers without one.
    pub country_code: String,
    /// Insert the region's mobile digit (Argentina: `9`).
    pub enforce_mobile_prefix: bool,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            country_code: DEFAULT_COUNTRY_CODE.to_owned(),
            enforce_mobile_prefix: true,
        }
    }
}

impl AddressConfig {
    /// The canonicalization policy these settings describe.
    pub fn policy(&self) -> AddressPolicy {
        AddressPolicy {
            country_code: self.country_code.clone(),
            enforce_mobile_prefix: self.enforce_mobile_prefix,
        }
    }
}

// ── WhatsApp config ─────────────────────────────────────────────

/// WhatsApp session settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhatsAppConfig {
    /// Credential store directory.
    pub auth_dir: PathBuf,
    /// Base URL of the protocol sidecar.
    pub bridge_url: String,
    /// Timeout for each send, in seconds.
    pub send_timeout_secs: u64,
    /// First reconnect delay, in milliseconds.
    pub reconnect_initial_ms: u64,
    /// Reconnect delay ceiling, in milliseconds.
    pub reconnect_max_ms: u64,
    /// Print pairing challenges to the terminal.
    pub print_qr_terminal: bool,
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            auth_dir: PathBuf::from("./auth"),
            bridge_url: DEFAULT_BRIDGE_URL.to_owned(),
            send_timeout_secs: 30,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 30_000,
            print_qr_terminal: true,
        }
    }
}

impl WhatsAppConfig {
    /// Supervisor and send tunables.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            send_timeout: Duration::from_secs(self.send_timeout_secs),
            reconnect_initial: Duration::from_millis(self.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.reconnect_max_ms),
            print_qr_terminal: self.print_qr_terminal,
        }
    }
}

// ── Log config ──────────────────────────────────────────────────

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for daily-rotated JSON logs. Console only when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: None,
        }
    }
}
