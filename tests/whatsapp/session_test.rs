//! Session supervisor behaviour against an in-memory transport.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::json;

use wa_relay::normalize::address::{canonicalize, AddressPolicy, Jid};
use wa_relay::whatsapp::{ConnectionState, SendError, WhatsAppError, WhatsAppEvent};

use crate::fake_transport::{open_session, start_session, wait_for_state, FakeTransport, WAIT_LIMIT};

fn jid() -> Jid {
    canonicalize("1155551234", &AddressPolicy::default()).expect("valid number")
}

#[tokio::test]
async fn new_session_is_connecting_and_not_ready() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (session, handle) = start_session(&transport, dir.path()).await;

    let state = session.state();
    assert_eq!(state.connection, ConnectionState::Connecting);
    assert!(!session.is_ready());
    assert!(!state.logged_out);
    handle.abort();
}

#[tokio::test]
async fn send_before_open_fails_fast_without_touching_transport() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (session, handle) = start_session(&transport, dir.path()).await;

    let result = session.send_text(&jid(), "hola").await;
    assert!(matches!(result, Err(SendError::NotReady)));
    assert_eq!(transport.send_count(), 0);
    handle.abort();
}

#[tokio::test]
async fn open_session_sends_through_transport() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (session, handle) = open_session(&transport, dir.path()).await;

    let receipt = session.send_text(&jid(), "hola").await.expect("send");
    assert_eq!(receipt.jid, "5491155551234@s.whatsapp.net");
    assert_eq!(
        transport.sent(),
        vec![("5491155551234@s.whatsapp.net".to_owned(), "hola".to_owned())]
    );
    assert_eq!(session.state().reconnect_attempts, 0);
    handle.abort();
}

#[tokio::test]
async fn qr_is_replaced_by_each_challenge_and_cleared_on_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (session, handle) = start_session(&transport, dir.path()).await;

    transport
        .emit(WhatsAppEvent::Qr { code: "first".to_owned() })
        .await;
    wait_for_state(&session, |s| s.pending_qr.as_deref() == Some("first")).await;
    assert_eq!(session.current_qr().as_deref(), Some("first"));

    transport
        .emit(WhatsAppEvent::Qr { code: "second".to_owned() })
        .await;
    wait_for_state(&session, |s| s.pending_qr.as_deref() == Some("second")).await;

    transport.emit(WhatsAppEvent::Open).await;
    let state = wait_for_state(&session, |s| s.is_ready()).await;
    assert!(state.pending_qr.is_none());
    assert!(session.current_qr().is_none());
    handle.abort();
}

#[tokio::test]
async fn logout_is_permanent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (session, handle) = open_session(&transport, dir.path()).await;

    transport
        .emit(WhatsAppEvent::Close {
            status_code: Some(401),
            reason: Some("logged out".to_owned()),
        })
        .await;

    let state = wait_for_state(&session, |s| s.logged_out).await;
    assert_eq!(state.connection, ConnectionState::Closed);
    assert!(!state.is_ready());

    tokio::time::timeout(WAIT_LIMIT, handle)
        .await
        .expect("supervisor should stop after logout")
        .expect("supervisor should not panic");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.connect_count(), 1);
    assert!(!session.is_ready());
    assert!(!session.wait_until_ready().await);
    assert!(matches!(
        session.send_text(&jid(), "hola").await,
        Err(SendError::NotReady)
    ));
}

#[tokio::test]
async fn logout_reason_without_status_is_permanent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (session, handle) = start_session(&transport, dir.path()).await;

    transport
        .emit(WhatsAppEvent::Close {
            status_code: None,
            reason: Some("loggedOut".to_owned()),
        })
        .await;

    wait_for_state(&session, |s| s.logged_out).await;
    tokio::time::timeout(WAIT_LIMIT, handle)
        .await
        .expect("supervisor should stop after logout")
        .expect("supervisor should not panic");
    assert_eq!(transport.connect_count(), 1);
}

#[tokio::test]
async fn wait_until_ready_wakes_on_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (session, handle) = start_session(&transport, dir.path()).await;

    let waiter = tokio::spawn({
        let session = session.clone();
        async move { session.wait_until_ready().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    transport.emit(WhatsAppEvent::Open).await;
    let ready = tokio::time::timeout(WAIT_LIMIT, waiter)
        .await
        .expect("waiter should wake on open")
        .expect("waiter should not panic");
    assert!(ready);
    handle.abort();
}

#[tokio::test]
async fn wait_until_ready_gives_up_on_logout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (session, handle) = start_session(&transport, dir.path()).await;

    let waiter = tokio::spawn({
        let session = session.clone();
        async move { session.wait_until_ready().await }
    });
    transport
        .emit(WhatsAppEvent::Close {
            status_code: Some(401),
            reason: None,
        })
        .await;

    let ready = tokio::time::timeout(WAIT_LIMIT, waiter)
        .await
        .expect("waiter should wake on logout")
        .expect("waiter should not panic");
    assert!(!ready);
    handle.abort();
}

#[tokio::test]
async fn transient_close_reconnects_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (session, handle) = open_session(&transport, dir.path()).await;

    transport
        .emit(WhatsAppEvent::Close {
            status_code: Some(428),
            reason: Some("connection closed".to_owned()),
        })
        .await;

    transport.wait_for_connects(2).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(transport.connect_count(), 2);

    let state = session.state();
    assert!(!state.logged_out);
    assert!(!state.is_ready());
    assert_eq!(state.reconnect_attempts, 1);
    assert_eq!(
        state.last_disconnect.as_ref().and_then(|c| c.status_code),
        Some(428)
    );

    transport.emit(WhatsAppEvent::Open).await;
    let state = wait_for_state(&session, |s| s.is_ready()).await;
    assert_eq!(state.reconnect_attempts, 0);
    handle.abort();
}

#[tokio::test]
async fn credential_update_is_persisted_before_next_event() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (session, handle) = start_session(&transport, dir.path()).await;

    let mut files = BTreeMap::new();
    files.insert("creds.json".to_owned(), json!({"noise_key": "abc"}));
    transport.emit(WhatsAppEvent::CredsUpdate { files }).await;
    transport.emit(WhatsAppEvent::Open).await;
    wait_for_state(&session, |s| s.is_ready()).await;

    let stored = std::fs::read_to_string(dir.path().join("creds.json")).expect("creds written");
    let stored: serde_json::Value = serde_json::from_str(&stored).expect("json");
    assert_eq!(stored, json!({"noise_key": "abc"}));
    handle.abort();
}

#[tokio::test]
async fn failed_credential_write_drops_the_connection() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (session, handle) = open_session(&transport, dir.path()).await;

    let mut files = BTreeMap::new();
    files.insert("../escape.json".to_owned(), json!({"noise_key": "abc"}));
    transport.emit(WhatsAppEvent::CredsUpdate { files }).await;

    transport.wait_for_connects(2).await;
    let state = session.state();
    assert!(!state.logged_out);
    assert!(!state.is_ready());
    let reason = state
        .last_disconnect
        .as_ref()
        .and_then(|c| c.reason.clone())
        .unwrap_or_default();
    assert!(reason.contains("not persisted"), "{reason}");
    assert!(!dir.path().join("../escape.json").exists());
    handle.abort();
}

#[tokio::test]
async fn reconnect_reuses_persisted_credentials() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (_session, handle) = start_session(&transport, dir.path()).await;
    assert!(transport.auth_for_connect(0).is_empty());

    let mut files = BTreeMap::new();
    files.insert("creds.json".to_owned(), json!({"me": "5491155551234"}));
    transport.emit(WhatsAppEvent::CredsUpdate { files }).await;
    transport
        .emit(WhatsAppEvent::Close {
            status_code: Some(515),
            reason: Some("restart required".to_owned()),
        })
        .await;

    transport.wait_for_connects(2).await;
    let auth = transport.auth_for_connect(1);
    assert_eq!(auth.get("creds.json"), Some(&json!({"me": "5491155551234"})));
    handle.abort();
}

#[tokio::test]
async fn slow_send_times_out_as_transport_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (session, handle) = open_session(&transport, dir.path()).await;
    transport.delay_sends(Duration::from_secs(2));

    let result = session.send_text(&jid(), "hola").await;
    assert!(matches!(
        result,
        Err(SendError::Transport(WhatsAppError::Timeout(_)))
    ));
    handle.abort();
}

#[tokio::test]
async fn transport_failure_is_surfaced() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let (session, handle) = open_session(&transport, dir.path()).await;
    transport.fail_sends();

    let result = session.send_image(&jid(), vec![1, 2, 3], "caption").await;
    assert!(matches!(
        result,
        Err(SendError::Transport(WhatsAppError::Bridge { status: 500, .. }))
    ));
    assert_eq!(transport.send_count(), 1);
    handle.abort();
}
