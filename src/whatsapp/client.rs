//! HTTP transport for the baileys-based WhatsApp sidecar.
//!
//! The sidecar owns the wire protocol. This client hands it the stored
//! credential material, sends messages through it, and relays its lifecycle
//! events via [`super::events::spawn_event_listener`].

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::credentials::AuthState;
use super::events::{spawn_event_listener, WhatsAppEvent};
use super::{SendReceipt, WhatsAppError, WhatsAppTransport};
use crate::normalize::address::Jid;

/// Default address of the sidecar.
pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:3001";

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout for normal operations.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Client for the sidecar HTTP API.
pub struct BridgeTransport {
    client: reqwest::Client,
    base_url: String,
}

/// Response envelope from the bridge HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    #[allow(dead_code)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Serialize)]
struct StartSession<'a> {
    auth: &'a AuthState,
}

#[derive(Serialize)]
struct SendText<'a> {
    jid: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct SendImage<'a> {
    jid: &'a str,
    image_base64: String,
    caption: &'a str,
}

#[derive(Default, Deserialize)]
struct SendAck {
    message_id: Option<String>,
}

impl BridgeTransport {
    /// Create a client pointing at the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { client, base_url }
    }

    /// Returns the base URL of the sidecar.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>, WhatsAppError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self.client.post(&url).json(body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<BridgeResponse<serde_json::Value>>(&body_text)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or(body_text);
            return Err(WhatsAppError::Bridge {
                status: status.as_u16(),
                message,
            });
        }
        let envelope: BridgeResponse<T> = resp.json().await?;
        Ok(envelope.data)
    }

    fn receipt(jid: &Jid, ack: Option<SendAck>) -> SendReceipt {
        SendReceipt {
            jid: jid.to_string(),
            message_id: ack.unwrap_or_default().message_id,
            sent_at: chrono::Utc::now(),
        }
    }
}

#[async_trait]
impl WhatsAppTransport for BridgeTransport {
    async fn connect(
        &self,
        auth: AuthState,
        events: mpsc::Sender<WhatsAppEvent>,
    ) -> Result<(), WhatsAppError> {
        let files = auth.len();
        self.post::<_, serde_json::Value>("/session/start", &StartSession { auth: &auth })
            .await?;
        info!(bridge = %self.base_url, files, "WhatsApp session start requested");

        // Detached; ends with the session.
        drop(spawn_event_listener(self.base_url.clone(), events));
        Ok(())
    }

    async fn send_text(&self, jid: &Jid, text: &str) -> Result<SendReceipt, WhatsAppError> {
        let ack: Option<SendAck> = self
            .post(
                "/send",
                &SendText {
                    jid: jid.as_str(),
                    text,
                },
            )
            .await?;
        debug!(%jid, "message sent via WhatsApp");
        Ok(Self::receipt(jid, ack))
    }

    async fn send_image(
        &self,
        jid: &Jid,
        image: Vec<u8>,
        caption: &str,
    ) -> Result<SendReceipt, WhatsAppError> {
        let bytes = image.len();
        let ack: Option<SendAck> = self
            .post(
                "/send-image",
                &SendImage {
                    jid: jid.as_str(),
                    image_base64: BASE64.encode(image),
                    caption,
                },
            )
            .await?;
        debug!(%jid, bytes, "image sent via WhatsApp");
        Ok(Self::receipt(jid, ack))
    }
}
