//! `POST /send`: direct text and image sends.

use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::routing::get;
use axum::Router;
use serde_json::json;

use wa_relay::config::ServerConfig;

use crate::fake_transport::WAIT_LIMIT;
use crate::TestApp;

async fn serve_image() -> String {
    let app = Router::new()
        .route(
            "/logo.png",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], vec![0x89_u8, b'P', b'N', b'G']) }),
        )
        .route("/missing.png", get(|| async { StatusCode::NOT_FOUND }))
        .route(
            "/stalled.png",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                StatusCode::OK
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn text_send_uses_webhook_rules() {
    let app = TestApp::ready().await;
    let (status, body) = app
        .post_json("/send", &json!({"to": "1155551234", "message": "hola"}))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["to"], "5491155551234@s.whatsapp.net");
    assert_eq!(app.transport.send_count(), 1);
}

#[tokio::test]
async fn image_is_downloaded_and_sent_with_caption() {
    let app = TestApp::ready().await;
    let base = serve_image().await;
    let (status, body) = app
        .post_json(
            "/send",
            &json!({"phone": "1155551234", "image_url": format!("{base}/logo.png"), "caption": "logo"}),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(
        app.transport.sent(),
        vec![(
            "5491155551234@s.whatsapp.net".to_owned(),
            "[image 4 bytes] logo".to_owned()
        )]
    );
}

#[tokio::test]
async fn image_caption_falls_back_to_message() {
    let app = TestApp::ready().await;
    let base = serve_image().await;
    let (status, _) = app
        .post_json(
            "/send",
            &json!({"phone": "1155551234", "image_url": format!("{base}/logo.png"), "message": "hi"}),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.transport.sent()[0].1, "[image 4 bytes] hi");
}

#[tokio::test]
async fn image_without_destination_is_rejected() {
    let app = TestApp::ready().await;
    let (status, body) = app
        .post_json("/send", &json!({"image_url": "https://example.com/a.png"}))
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["missing"], json!(["phone"]));
    assert_eq!(app.transport.send_count(), 0);
}

#[tokio::test]
async fn non_http_image_url_is_rejected() {
    let app = TestApp::ready().await;
    let (status, body) = app
        .post_json(
            "/send",
            &json!({"phone": "1155551234", "image_url": "file:///etc/passwd"}),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn image_send_checks_readiness_first() {
    let app = TestApp::connecting().await;
    let (status, body) = app
        .post_json(
            "/send",
            &json!({"phone": "1155551234", "image_url": "http://127.0.0.1:9/a.png"}),
        )
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["kind"], "not_ready");
}

#[tokio::test]
async fn failed_download_is_a_transport_error() {
    let app = TestApp::ready().await;
    let base = serve_image().await;
    let (status, body) = app
        .post_json(
            "/send",
            &json!({"phone": "1155551234", "image_url": format!("{base}/missing.png")}),
        )
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["kind"], "transport");
    assert_eq!(app.transport.send_count(), 0);
}

#[tokio::test]
async fn stalled_download_is_cut_off_by_media_timeout() {
    let server = ServerConfig {
        media_timeout_secs: 1,
        ..ServerConfig::default()
    };
    let app = TestApp::ready_with(&server).await;
    let base = serve_image().await;
    let payload = json!({"phone": "1155551234", "image_url": format!("{base}/stalled.png")});
    let request = app.post_json("/send", &payload);
    let (status, body) = tokio::time::timeout(WAIT_LIMIT, request)
        .await
        .expect("download should be abandoned before the test limit");

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["kind"], "transport");
    assert_eq!(app.transport.send_count(), 0);
}

#[tokio::test]
async fn oversized_image_is_rejected_before_sending() {
    let server = ServerConfig {
        max_media_bytes: 2,
        ..ServerConfig::default()
    };
    let app = TestApp::ready_with(&server).await;
    let base = serve_image().await;
    let (status, body) = app
        .post_json(
            "/send",
            &json!({"phone": "1155551234", "image_url": format!("{base}/logo.png")}),
        )
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["kind"], "transport");
    assert!(
        body["error"].as_str().unwrap_or_default().contains("exceeds 2 bytes"),
        "{body}"
    );
    assert_eq!(app.transport.send_count(), 0);
}

#[tokio::test]
async fn image_within_limit_is_sent() {
    let server = ServerConfig {
        max_media_bytes: 4,
        ..ServerConfig::default()
    };
    let app = TestApp::ready_with(&server).await;
    let base = serve_image().await;
    let (status, _) = app
        .post_json(
            "/send",
            &json!({"phone": "1155551234", "image_url": format!("{base}/logo.png")}),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.transport.send_count(), 1);
}
