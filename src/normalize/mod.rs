//! Payload normalization: field extraction and address canonicalization.
//!
//! Both halves are pure functions over their input:
//! - [`extract::extract_fields`] searches a webhook payload for a destination
//!   and a message body using ordered path tables
//! - [`address::canonicalize`] turns a phone-like string into a [`address::Jid`]

pub mod address;
pub mod extract;

/// Field name reported when no destination candidate matched.
pub const DESTINATION_FIELD: &str = "phone";

/// Field name reported when no body candidate matched.
pub const BODY_FIELD: &str = "message";

/// Client-caused input errors. Always surfaced as HTTP 400 and never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The payload lacked one or more required fields.
    #[error("missing fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    /// The destination could not be canonicalized into a JID.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The request body was not valid JSON.
    #[error("invalid JSON body: {0}")]
    InvalidJson(String),

    /// A media URL was not an absolute `http`/`https` URL.
    #[error("invalid media URL: {0}")]
    InvalidMediaUrl(String),
}

/// Destination and body pulled out of a webhook payload.
///
/// Both fields are non-empty; construction goes through
/// [`extract::ExtractedFields::into_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedMessage {
    /// Raw destination, before canonicalization.
    pub destination: String,
    /// Message text.
    pub body: String,
}
