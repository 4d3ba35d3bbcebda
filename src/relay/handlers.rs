//! Request handlers and the webhook relay core.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{AppState, RelayError};
use crate::normalize::address::{canonicalize, AddressPolicy, Jid};
use crate::normalize::extract::extract_fields;
use crate::normalize::{ValidationError, DESTINATION_FIELD};
use crate::whatsapp::{ConnectionState, Session};

/// Status endpoint body.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Always `true`; the process is up.
    pub ok: bool,
    /// `whatsapp_ready` or `whatsapp_connecting`.
    pub status: &'static str,
    /// Underlying connection state.
    pub state: ConnectionState,
    /// The device was logged out and needs re-pairing.
    pub logged_out: bool,
}

/// Body of a successful send.
#[derive(Debug, Serialize)]
pub struct SendResponse {
    /// Always `true`.
    pub ok: bool,
    /// Canonical destination.
    pub to: Jid,
}

/// Media fields accepted by `POST /send`.
#[derive(Debug, Default, Deserialize)]
struct MediaFields {
    image_url: Option<String>,
    caption: Option<String>,
}

/// `GET /` and `GET /healthz`.
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let snapshot = state.session.state();
    Json(StatusResponse {
        ok: true,
        status: if snapshot.is_ready() {
            "whatsapp_ready"
        } else {
            "whatsapp_connecting"
        },
        state: snapshot.connection,
        logged_out: snapshot.logged_out,
    })
}

/// `GET /qr.png`: 404 unless a pairing challenge is pending.
pub async fn qr_png(State(state): State<AppState>) -> Response {
    let Some(code) = state.session.current_qr() else {
        return no_pending_qr();
    };
    match crate::qr::render_png(&code) {
        Ok(png) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Err(e) => render_failed(&e),
    }
}

/// `GET /qr.svg`: 404 unless a pairing challenge is pending.
pub async fn qr_svg(State(state): State<AppState>) -> Response {
    let Some(code) = state.session.current_qr() else {
        return no_pending_qr();
    };
    match crate::qr::render_svg(&code) {
        Ok(svg) => ([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response(),
        Err(e) => render_failed(&e),
    }
}

fn no_pending_qr() -> Response {
    (StatusCode::NOT_FOUND, "no pending QR code").into_response()
}

fn render_failed(e: &crate::qr::QrRenderError) -> Response {
    warn!(error = %e, "failed to render QR code");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

/// `POST <webhook_path>`: relay a Chatwoot event as a WhatsApp message.
pub async fn chatwoot_webhook(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SendResponse>, RelayError> {
    async move {
        let payload = parse_payload(&body)
            .map_err(RelayError::from)
            .inspect_err(log_rejection)?;
        let to = handle_webhook(&state.session, &state.address_policy, &payload)
            .await
            .inspect_err(log_rejection)?;
        Ok::<_, RelayError>(Json(SendResponse { ok: true, to }))
    }
    .instrument(request_span("webhook"))
    .await
}

/// `POST /send`: send text, or an image fetched from `image_url`.
pub async fn direct_send(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SendResponse>, RelayError> {
    async move {
        let payload = parse_payload(&body)
            .map_err(RelayError::from)
            .inspect_err(log_rejection)?;
        let to = handle_direct_send(&state, &payload)
            .await
            .inspect_err(log_rejection)?;
        Ok::<_, RelayError>(Json(SendResponse { ok: true, to }))
    }
    .instrument(request_span("send"))
    .await
}

/// Relay one webhook payload: extract, canonicalize, send.
///
/// Exactly one send attempt or one rejection per call. Nothing is retried
/// or queued.
///
/// # Errors
///
/// [`RelayError::Validation`] before any send is attempted when fields are
/// missing or the destination is invalid; [`RelayError::NotReady`] or
/// [`RelayError::Transport`] from the send itself.
pub async fn handle_webhook(
    session: &Session,
    policy: &AddressPolicy,
    payload: &Value,
) -> Result<Jid, RelayError> {
    let message = extract_fields(payload).into_message()?;
    let jid = resolve_destination(&message.destination, policy)?;
    session.send_text(&jid, &message.body).await?;
    info!(%jid, "relayed webhook message");
    Ok(jid)
}

async fn handle_direct_send(state: &AppState, payload: &Value) -> Result<Jid, RelayError> {
    let media: MediaFields = serde_json::from_value(payload.clone()).unwrap_or_default();
    let Some(image_url) = media.image_url else {
        return handle_webhook(&state.session, &state.address_policy, payload).await;
    };

    let fields = extract_fields(payload);
    let destination = fields
        .destination
        .ok_or_else(|| ValidationError::MissingFields(vec![DESTINATION_FIELD]))?;
    let jid = resolve_destination(&destination, &state.address_policy)?;
    let url = parse_media_url(&image_url)?;

    if !state.session.is_ready() {
        return Err(RelayError::NotReady);
    }
    let limits = state.media_limits;
    let download = download_image(&state.http, url, limits.max_bytes);
    let image = tokio::time::timeout(limits.timeout, download)
        .await
        .map_err(|_| {
            RelayError::Transport(format!("image download timed out after {:?}", limits.timeout))
        })??;
    let caption = media.caption.or(fields.body).unwrap_or_default();
    state.session.send_image(&jid, image, &caption).await?;
    info!(%jid, "relayed image message");
    Ok(jid)
}

fn resolve_destination(raw: &str, policy: &AddressPolicy) -> Result<Jid, ValidationError> {
    canonicalize(raw, policy).ok_or_else(|| ValidationError::InvalidAddress(raw.to_owned()))
}

/// An empty body is treated as an empty object so the caller learns which
/// fields are missing.
fn parse_payload(body: &[u8]) -> Result<Value, ValidationError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_slice(body).map_err(|e| ValidationError::InvalidJson(e.to_string()))
}

fn parse_media_url(raw: &str) -> Result<url::Url, ValidationError> {
    let url = url::Url::parse(raw).map_err(|_| ValidationError::InvalidMediaUrl(raw.to_owned()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ValidationError::InvalidMediaUrl(raw.to_owned())),
    }
}

async fn download_image(
    http: &reqwest::Client,
    url: url::Url,
    max_bytes: usize,
) -> Result<Vec<u8>, RelayError> {
    let mut resp = http.get(url.clone()).send().await.map_err(download_failed)?;
    if !resp.status().is_success() {
        return Err(RelayError::Transport(format!(
            "failed to download image ({})",
            resp.status()
        )));
    }
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX);
    if resp.content_length().is_some_and(|len| len > limit) {
        return Err(image_too_large(max_bytes));
    }

    let mut image = Vec::new();
    while let Some(chunk) = resp.chunk().await.map_err(download_failed)? {
        if image.len().saturating_add(chunk.len()) > max_bytes {
            return Err(image_too_large(max_bytes));
        }
        image.extend_from_slice(&chunk);
    }
    debug!(%url, bytes = image.len(), "downloaded image");
    Ok(image)
}

fn download_failed(e: reqwest::Error) -> RelayError {
    RelayError::Transport(format!("failed to download image: {e}"))
}

fn image_too_large(max_bytes: usize) -> RelayError {
    RelayError::Transport(format!("image exceeds {max_bytes} bytes"))
}

/// Correlates every log line of one relay request.
fn request_span(route: &'static str) -> tracing::Span {
    info_span!("relay_request", route, request_id = %Uuid::new_v4())
}

fn log_rejection(err: &RelayError) {
    match err {
        RelayError::Validation(e) => debug!(error = %e, "rejected relay request"),
        RelayError::NotReady => warn!("relay request while WhatsApp is not ready"),
        RelayError::Transport(e) => warn!(error = %e, "WhatsApp send failed"),
    }
}
