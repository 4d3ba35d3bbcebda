//! The single WhatsApp session and its supervisor.
//!
//! State machine: `connecting -> open`, `connecting -> closed`,
//! `open -> closed`, `closed -> connecting` (retry). The supervisor task is
//! the only writer; it consumes transport events from one channel and
//! publishes a whole [`SessionState`] value through a `watch` channel on
//! every transition, so readers never observe a half-applied change.
//!
//! Closes are retried with capped exponential backoff. A logged-out close
//! ends the supervisor for good.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::credentials::{AuthState, CredentialStore};
use super::events::{event_kind, DisconnectCause, WhatsAppEvent};
use super::{SendError, SendReceipt, WhatsAppError, WhatsAppTransport};
use crate::normalize::address::Jid;

/// Capacity of the transport event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Upper bound of the random jitter added to each backoff, as a divisor of
/// the base delay (10%).
const JITTER_DIVISOR: u64 = 10;

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Opening, or waiting for device pairing.
    Connecting,
    /// Authenticated; sends are accepted.
    Open,
    /// Closed; either waiting to reconnect or logged out.
    Closed,
}

/// Snapshot of the session, published as one value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    /// Current connection state.
    pub connection: ConnectionState,
    /// Pairing challenge awaiting a scan. Only set while connecting.
    pub pending_qr: Option<String>,
    /// Cause of the most recent close.
    pub last_disconnect: Option<DisconnectCause>,
    /// The device was logged out; the session will not come back.
    pub logged_out: bool,
    /// Reconnects since the last successful open.
    pub reconnect_attempts: u32,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Connecting,
            pending_qr: None,
            last_disconnect: None,
            logged_out: false,
            reconnect_attempts: 0,
        }
    }
}

impl SessionState {
    /// Sends succeed only from the open state.
    pub fn is_ready(&self) -> bool {
        self.connection == ConnectionState::Open
    }
}

/// Tunables for the supervisor and for sends.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Limit on each transport send call.
    pub send_timeout: Duration,
    /// First reconnect delay.
    pub reconnect_initial: Duration,
    /// Ceiling for the reconnect delay.
    pub reconnect_max: Duration,
    /// Print each new pairing challenge to stderr.
    pub print_qr_terminal: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(30),
            reconnect_initial: Duration::from_millis(1000),
            reconnect_max: Duration::from_millis(30_000),
            print_qr_terminal: true,
        }
    }
}

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Start at `initial`, doubling up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);

        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let jitter_cap = base_ms.checked_div(JITTER_DIVISOR).unwrap_or(0);
        let jitter_ms = rand::thread_rng().gen_range(0..=jitter_cap);
        base.saturating_add(Duration::from_millis(jitter_ms))
    }

    /// Back to the initial delay after a healthy connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Handle to the session. Cheap to clone; every clone sees the same state.
#[derive(Clone)]
pub struct Session {
    transport: Arc<dyn WhatsAppTransport>,
    state: watch::Receiver<SessionState>,
    send_timeout: Duration,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &*self.state.borrow())
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl Session {
    /// Whether sends are currently accepted.
    pub fn is_ready(&self) -> bool {
        self.state.borrow().is_ready()
    }

    /// The pending pairing challenge, if any.
    pub fn current_qr(&self) -> Option<String> {
        self.state.borrow().pending_qr.clone()
    }

    /// A copy of the current state.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the session opens. Returns `false` if it was logged out or
    /// the supervisor stopped first.
    pub async fn wait_until_ready(&self) -> bool {
        let mut rx = self.state.clone();
        let ready = rx
            .wait_for(|s| s.is_ready() || s.logged_out)
            .await
            .is_ok_and(|state| state.is_ready());
        ready
    }

    /// Send a text message. Fails fast when the session is not open.
    ///
    /// # Errors
    ///
    /// [`SendError::NotReady`] when not open; [`SendError::Transport`] when
    /// the transport fails or exceeds the send timeout.
    pub async fn send_text(&self, jid: &Jid, text: &str) -> Result<SendReceipt, SendError> {
        self.ensure_ready()?;
        let receipt = self
            .with_timeout(self.transport.send_text(jid, text))
            .await?;
        debug!(%jid, "text message sent");
        Ok(receipt)
    }

    /// Send an image. Fails fast when the session is not open.
    ///
    /// # Errors
    ///
    /// [`SendError::NotReady`] when not open; [`SendError::Transport`] when
    /// the transport fails or exceeds the send timeout.
    pub async fn send_image(
        &self,
        jid: &Jid,
        image: Vec<u8>,
        caption: &str,
    ) -> Result<SendReceipt, SendError> {
        self.ensure_ready()?;
        let receipt = self
            .with_timeout(self.transport.send_image(jid, image, caption))
            .await?;
        debug!(%jid, "image message sent");
        Ok(receipt)
    }

    fn ensure_ready(&self) -> Result<(), SendError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(SendError::NotReady)
        }
    }

    async fn with_timeout(
        &self,
        call: impl std::future::Future<Output = Result<SendReceipt, WhatsAppError>>,
    ) -> Result<SendReceipt, WhatsAppError> {
        tokio::time::timeout(self.send_timeout, call)
            .await
            .map_err(|_| WhatsAppError::Timeout(self.send_timeout))?
    }
}

/// Start the session supervisor.
///
/// Returns the shared [`Session`] handle and the supervisor task. The task
/// runs until the device is logged out or it is aborted.
pub fn spawn_session(
    transport: Arc<dyn WhatsAppTransport>,
    store: CredentialStore,
    settings: SessionSettings,
) -> (Session, tokio::task::JoinHandle<()>) {
    let (state_tx, state_rx) = watch::channel(SessionState::default());

    let session = Session {
        transport: Arc::clone(&transport),
        state: state_rx,
        send_timeout: settings.send_timeout,
    };

    let supervisor = Supervisor {
        transport,
        store,
        settings,
        state_tx,
    };

    (session, tokio::spawn(supervisor.run()))
}

/// How one connection ended.
enum Outcome {
    LoggedOut(DisconnectCause),
    Disconnected(DisconnectCause),
}

struct Supervisor {
    transport: Arc<dyn WhatsAppTransport>,
    store: CredentialStore,
    settings: SessionSettings,
    state_tx: watch::Sender<SessionState>,
}

impl Supervisor {
    async fn run(self) {
        let mut backoff = Backoff::new(self.settings.reconnect_initial, self.settings.reconnect_max);

        loop {
            self.publish(|s| {
                s.connection = ConnectionState::Connecting;
                s.pending_qr = None;
            });
            info!(attempt = self.state_tx.borrow().reconnect_attempts, "opening WhatsApp session");

            match self.connect_once(&mut backoff).await {
                Ok(Outcome::LoggedOut(cause)) => {
                    self.publish(|s| {
                        s.connection = ConnectionState::Closed;
                        s.pending_qr = None;
                        s.logged_out = true;
                        s.last_disconnect = Some(cause.clone());
                    });
                    error!(
                        error = %WhatsAppError::LoggedOut,
                        cause = %cause,
                        auth_dir = %self.store.dir().display(),
                        "WhatsApp session logged out; not reconnecting"
                    );
                    return;
                }
                Ok(Outcome::Disconnected(cause)) => {
                    warn!(cause = %cause, "WhatsApp session closed");
                    self.publish(|s| {
                        s.connection = ConnectionState::Closed;
                        s.pending_qr = None;
                        s.last_disconnect = Some(cause);
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to open WhatsApp session");
                    self.publish(|s| {
                        s.connection = ConnectionState::Closed;
                        s.pending_qr = None;
                    });
                }
            }

            let delay = backoff.next_delay();
            let backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            info!(backoff_ms, "reconnecting WhatsApp session");
            tokio::time::sleep(delay).await;
            self.publish(|s| s.reconnect_attempts = s.reconnect_attempts.saturating_add(1));
        }
    }

    /// Load credentials, open one connection, and drive it until it closes.
    async fn connect_once(&self, backoff: &mut Backoff) -> Result<Outcome, WhatsAppError> {
        let auth = self.load_credentials().await?;
        if auth.is_empty() {
            info!(auth_dir = %self.store.dir().display(), "no stored credentials; pairing will be required");
        }

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.transport.connect(auth, event_tx).await?;

        while let Some(event) = event_rx.recv().await {
            debug!(kind = event_kind(&event), "handling WhatsApp event");
            match event {
                WhatsAppEvent::Qr { code } => self.on_qr(code),
                WhatsAppEvent::Open => {
                    backoff.reset();
                    self.publish(|s| {
                        s.connection = ConnectionState::Open;
                        s.pending_qr = None;
                        s.reconnect_attempts = 0;
                    });
                    info!("WhatsApp session open");
                }
                WhatsAppEvent::Close {
                    status_code,
                    reason,
                } => {
                    let cause = DisconnectCause {
                        status_code,
                        reason,
                    };
                    return Ok(if cause.is_logged_out() {
                        Outcome::LoggedOut(cause)
                    } else {
                        Outcome::Disconnected(cause)
                    });
                }
                // Awaited before the next event is read; a failed write ends
                // the connection.
                WhatsAppEvent::CredsUpdate { files } => {
                    if let Err(e) = self.persist_credentials(files).await {
                        error!(error = %e, "failed to persist credential update");
                        return Ok(Outcome::Disconnected(DisconnectCause::persist_failed(&e)));
                    }
                }
            }
        }

        Ok(Outcome::Disconnected(DisconnectCause::connection_lost(
            "event stream ended",
        )))
    }

    fn on_qr(&self, code: String) {
        info!("WhatsApp pairing required; scan the QR code");
        if self.settings.print_qr_terminal {
            match crate::qr::render_terminal(&code) {
                Ok(rendered) => eprintln!("{rendered}"),
                Err(e) => warn!(error = %e, "failed to render QR code"),
            }
        }
        self.publish(|s| {
            s.connection = ConnectionState::Connecting;
            s.pending_qr = Some(code);
        });
    }

    async fn load_credentials(&self) -> Result<AuthState, WhatsAppError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(|e| join_error(self.store.dir(), e))?
    }

    async fn persist_credentials(
        &self,
        files: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> Result<(), WhatsAppError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.persist(&files))
            .await
            .map_err(|e| join_error(self.store.dir(), e))?
    }

    /// Replace the published state with a modified copy.
    fn publish(&self, change: impl FnOnce(&mut SessionState)) {
        let mut next = self.state_tx.borrow().clone();
        change(&mut next);
        self.state_tx.send_replace(next);
    }
}

fn join_error(dir: &std::path::Path, e: tokio::task::JoinError) -> WhatsAppError {
    WhatsAppError::CredentialStore {
        path: dir.display().to_string(),
        source: std::io::Error::other(e),
    }
}
