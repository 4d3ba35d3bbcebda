//! HTTP surface: status endpoint, QR images, the Chatwoot webhook, and direct sends.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::normalize::address::AddressPolicy;
use crate::normalize::ValidationError;
use crate::whatsapp::{SendError, Session};

pub mod handlers;

/// Paths served by the router regardless of configuration. The webhook path
/// must not reuse any of them.
pub const FIXED_ROUTES: &[&str] = &["/", "/healthz", "/qr.png", "/qr.svg", "/send"];

/// HTTP connect timeout for media downloads.
const MEDIA_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Bounds on images fetched for `POST /send`.
#[derive(Debug, Clone, Copy)]
pub struct MediaLimits {
    /// Limit on the whole download, body included.
    pub timeout: Duration,
    /// Largest accepted image, in bytes.
    pub max_bytes: usize,
}

impl Default for MediaLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// The WhatsApp session.
    pub session: Session,
    /// Destination canonicalization policy.
    pub address_policy: Arc<AddressPolicy>,
    /// Client used to download media for direct sends.
    pub http: reqwest::Client,
    /// Bounds on those downloads.
    pub media_limits: MediaLimits,
}

impl AppState {
    /// Build handler state around a session, with default media limits.
    pub fn new(session: Session, address_policy: AddressPolicy) -> Self {
        let media_limits = MediaLimits::default();
        Self {
            session,
            address_policy: Arc::new(address_policy),
            http: media_client(&media_limits),
            media_limits,
        }
    }

    /// Replace the media download limits.
    #[must_use]
    pub fn with_media_limits(mut self, media_limits: MediaLimits) -> Self {
        self.http = media_client(&media_limits);
        self.media_limits = media_limits;
        self
    }
}

fn media_client(limits: &MediaLimits) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(MEDIA_CONNECT_TIMEOUT_SECS).min(limits.timeout))
        .timeout(limits.timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to build media client with timeouts, using default");
            reqwest::Client::default()
        })
}

/// Whether `path` can be registered as the webhook route: absolute, made of
/// plain path characters, and not one of [`FIXED_ROUTES`].
pub fn is_valid_webhook_path(path: &str) -> bool {
    path.starts_with('/')
        && path.len() > 1
        && path
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '~'))
        && !FIXED_ROUTES.contains(&path)
}

/// Create the HTTP router.
pub fn build_router(state: AppState, server: &ServerConfig) -> Router {
    Router::new()
        .route("/", get(handlers::status))
        .route("/healthz", get(handlers::status))
        .route("/qr.png", get(handlers::qr_png))
        .route("/qr.svg", get(handlers::qr_svg))
        .route(&server.webhook_path, post(handlers::chatwoot_webhook))
        .route("/send", post(handlers::direct_send))
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(server.body_limit_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// A rejected relay request. Each kind maps to one status code and is never
/// conflated with another.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Client input was unusable. HTTP 400.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The session is not authenticated. HTTP 500.
    #[error("WhatsApp session is not ready yet")]
    NotReady,

    /// The send (or a media download) failed. HTTP 500.
    #[error("{0}")]
    Transport(String),
}

impl From<SendError> for RelayError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::NotReady => Self::NotReady,
            SendError::Transport(e) => Self::Transport(e.to_string()),
        }
    }
}

impl RelayError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotReady | Self::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotReady => "not_ready",
            Self::Transport(_) => "transport",
        }
    }
}

/// Error body returned for every rejected request.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Always `false`.
    pub ok: bool,
    /// Error kind: `validation`, `not_ready` or `transport`.
    pub kind: &'static str,
    /// Human-readable message.
    pub error: String,
    /// Fields that were missing, for validation failures.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<&'static str>,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let missing = match &self {
            Self::Validation(ValidationError::MissingFields(fields)) => fields.clone(),
            _ => Vec::new(),
        };
        let body = ErrorBody {
            ok: false,
            kind: self.kind(),
            error: self.to_string(),
            missing,
        };
        (self.status_code(), Json(body)).into_response()
    }
}
