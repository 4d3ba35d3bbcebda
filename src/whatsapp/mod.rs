//! WhatsApp session: transport seam, lifecycle supervisor, and credential store.
//!
//! The protocol itself lives behind [`WhatsAppTransport`]. In production that
//! is [`client::BridgeTransport`], which talks to a baileys-based sidecar over
//! HTTP and long-polls it for lifecycle events. [`session::spawn_session`]
//! owns the single session and republishes its state to readers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::normalize::address::Jid;

pub mod client;
pub mod credentials;
pub mod events;
pub mod session;

pub use credentials::{AuthState, CredentialStore};
pub use events::{DisconnectCause, WhatsAppEvent};
pub use session::{spawn_session, ConnectionState, Session, SessionSettings, SessionState};

/// Errors from the WhatsApp transport and session plumbing.
#[derive(Debug, thiserror::Error)]
pub enum WhatsAppError {
    /// HTTP request to the sidecar failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The sidecar answered with an error.
    #[error("bridge returned {status}: {message}")]
    Bridge {
        /// HTTP status code returned by the sidecar.
        status: u16,
        /// Error text from the sidecar.
        message: String,
    },

    /// The transport did not answer within the send timeout.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// The linked device was logged out. Not retryable.
    #[error("session logged out; clear the credential store and restart")]
    LoggedOut,

    /// Reading or writing the credential store failed.
    #[error("credential store error at {path}: {source}")]
    CredentialStore {
        /// File or directory involved.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding or decoding failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why a send did not go out.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The session is not open yet (or was logged out). Nothing was queued.
    #[error("WhatsApp session is not ready yet")]
    NotReady,

    /// The transport call failed or timed out.
    #[error(transparent)]
    Transport(#[from] WhatsAppError),
}

/// Acknowledgement of a sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Destination the message went to.
    pub jid: String,
    /// Protocol message identifier, when the transport reports one.
    pub message_id: Option<String>,
    /// When the transport acknowledged the send.
    pub sent_at: DateTime<Utc>,
}

/// The protocol client, consumed as a black box.
///
/// Implementations open a session from stored credential material and push
/// its lifecycle events into the supplied channel until the session closes.
#[async_trait]
pub trait WhatsAppTransport: Send + Sync {
    /// Open a session with `auth` and stream its events into `events`.
    ///
    /// Returns once the session has been started; events keep arriving
    /// asynchronously. A stream that ends must end with
    /// [`WhatsAppEvent::Close`] or by dropping the sender.
    ///
    /// # Errors
    ///
    /// Returns [`WhatsAppError`] when the session could not be started.
    async fn connect(
        &self,
        auth: AuthState,
        events: mpsc::Sender<WhatsAppEvent>,
    ) -> Result<(), WhatsAppError>;

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// Returns [`WhatsAppError`] on network failure or remote rejection.
    async fn send_text(&self, jid: &Jid, text: &str) -> Result<SendReceipt, WhatsAppError>;

    /// Send an image with an optional caption.
    ///
    /// # Errors
    ///
    /// Returns [`WhatsAppError`] on network failure or remote rejection.
    async fn send_image(
        &self,
        jid: &Jid,
        image: Vec<u8>,
        caption: &str,
    ) -> Result<SendReceipt, WhatsAppError>;
}
