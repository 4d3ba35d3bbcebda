//! Session lifecycle events and the sidecar event listener.
//!
//! The sidecar exposes an `/events/poll` HTTP long-polling endpoint. The
//! listener forwards everything it receives into an mpsc channel and stops
//! after the session closes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::WhatsAppError;

/// Status code the protocol uses for a logged-out device.
pub const LOGGED_OUT_STATUS: u16 = 401;

/// Status code reported when the event stream itself was lost.
pub const CONNECTION_LOST_STATUS: u16 = 408;

/// Long-poll timeout for the HTTP client (seconds).
const POLL_TIMEOUT_SECS: u64 = 60;

/// Pause after a non-200 poll response (seconds).
const POLL_RETRY_SECS: u64 = 5;

/// A lifecycle event of the protocol session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WhatsAppEvent {
    /// Device pairing is required; scan this challenge.
    #[serde(rename = "qr")]
    Qr {
        /// Raw challenge string.
        code: String,
    },
    /// The session is authenticated and can send.
    #[serde(rename = "open")]
    Open,
    /// The session closed.
    #[serde(rename = "close")]
    Close {
        /// Protocol disconnect code, if known.
        status_code: Option<u16>,
        /// Human-readable reason, if available.
        reason: Option<String>,
    },
    /// Session keys rotated; these files must be persisted.
    #[serde(rename = "creds")]
    CredsUpdate {
        /// File name to content. `null` deletes the file.
        files: BTreeMap<String, serde_json::Value>,
    },
}

/// Why a session closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectCause {
    /// Protocol disconnect code, if known.
    pub status_code: Option<u16>,
    /// Human-readable reason, if available.
    pub reason: Option<String>,
}

impl DisconnectCause {
    /// Build the cause used when the event stream broke without a close event.
    pub fn connection_lost(detail: impl Into<String>) -> Self {
        Self {
            status_code: Some(CONNECTION_LOST_STATUS),
            reason: Some(detail.into()),
        }
    }

    /// Build the cause used when a credential update could not be stored.
    pub fn persist_failed(err: &WhatsAppError) -> Self {
        Self {
            status_code: None,
            reason: Some(format!("credential update not persisted: {err}")),
        }
    }

    /// Whether the remote logged this device out. Logged-out sessions are
    /// never retried.
    pub fn is_logged_out(&self) -> bool {
        if self.status_code == Some(LOGGED_OUT_STATUS) {
            return true;
        }
        self.reason.as_deref().is_some_and(|reason| {
            let folded: String = reason
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase();
            folded == "loggedout"
        })
    }
}

impl std::fmt::Display for DisconnectCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.status_code, self.reason.as_deref()) {
            (Some(code), Some(reason)) => write!(f, "{code} ({reason})"),
            (Some(code), None) => write!(f, "{code}"),
            (None, Some(reason)) => f.write_str(reason),
            (None, None) => f.write_str("unknown"),
        }
    }
}

/// Spawn a listener that forwards sidecar events to `event_tx`.
///
/// Returns immediately. The task ends after forwarding a
/// [`WhatsAppEvent::Close`], when the receiver is dropped, or when polling
/// fails; a failed poll is reported as a close with
/// [`CONNECTION_LOST_STATUS`] so the supervisor reconnects.
pub fn spawn_event_listener(
    base_url: String,
    event_tx: mpsc::Sender<WhatsAppEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let poll_url = format!("{base_url}/events/poll");
        info!(url = %poll_url, "listening to WhatsApp event stream");

        if let Err(e) = poll_events(&poll_url, &event_tx).await {
            warn!(error = %e, "WhatsApp event stream failed");
            let cause = DisconnectCause::connection_lost(e.to_string());
            let _ = event_tx
                .send(WhatsAppEvent::Close {
                    status_code: cause.status_code,
                    reason: cause.reason,
                })
                .await;
        }
    })
}

/// Poll until the session closes or the receiver goes away. Returns `Err` on
/// non-timeout network errors.
async fn poll_events(
    poll_url: &str,
    event_tx: &mpsc::Sender<WhatsAppEvent>,
) -> Result<(), WhatsAppError> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(POLL_TIMEOUT_SECS))
        .build()?;

    loop {
        match client.get(poll_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let mut events = resp.json::<Vec<WhatsAppEvent>>().await?.into_iter();
                while let Some(event) = events.next() {
                    debug!(kind = event_kind(&event), "received WhatsApp event");
                    let closed = matches!(event, WhatsAppEvent::Close { .. });
                    if event_tx.send(event).await.is_err() {
                        return Ok(());
                    }
                    if closed {
                        let discarded = events.len();
                        if discarded > 0 {
                            warn!(discarded, "discarding WhatsApp events received after close");
                        }
                        return Ok(());
                    }
                }
            }
            Ok(resp) => {
                debug!(status = %resp.status(), "event poll returned non-200");
                tokio::time::sleep(std::time::Duration::from_secs(POLL_RETRY_SECS)).await;
            }
            Err(e) if e.is_timeout() => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Short label for logging. Never includes challenge or key material.
pub fn event_kind(event: &WhatsAppEvent) -> &'static str {
    match event {
        WhatsAppEvent::Qr { .. } => "qr",
        WhatsAppEvent::Open => "open",
        WhatsAppEvent::Close { .. } => "close",
        WhatsAppEvent::CredsUpdate { .. } => "creds",
    }
}
