//! HTTP surface integration tests.
//!
//! Requests go through the full router, middleware included, backed by a
//! registry with in-process capture and transcoder stand-ins.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use futures::StreamExt;
use tower::ServiceExt;

use restream::api::{ApiServer, ApiServerConfig, AppState};
use restream::session::{CloseReason, SessionId, SessionRegistry};

use common::{FakeCapture, FakeTranscoder, PLAYLIST, eventually, registry, test_config};

const SOURCE: &str = "https://example.com/live/page";
const SOURCE_QUERY: &str = "https%3A%2F%2Fexample.com%2Flive%2Fpage";

struct TestApp {
    router: Router,
    registry: Arc<SessionRegistry>,
    capture: Arc<FakeCapture>,
    transcoder: Arc<FakeTranscoder>,
    _dir: tempfile::TempDir,
}

fn test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let capture = Arc::new(FakeCapture::default());
    let transcoder = Arc::new(FakeTranscoder::default());
    let registry = registry(capture.clone(), transcoder.clone(), test_config(dir.path()));
    let server = ApiServer::with_state(
        ApiServerConfig::default(),
        AppState::new(Arc::clone(&registry)),
    );

    TestApp {
        router: server.build_router(),
        registry,
        capture,
        transcoder,
        _dir: dir,
    }
}

async fn get(router: &Router, uri: &str) -> axum::response::Response {
    router
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_missing_url_is_rejected() {
    let app = test_app();

    let response = get(&app.router, "/api/stream").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = get(&app.router, "/api/stream?url=").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(body_string(response).await.contains("BAD_REQUEST"));

    assert_eq!(app.capture.opens(), 0);
}

#[tokio::test]
async fn test_unknown_stream_type_is_rejected() {
    let app = test_app();

    let uri = format!("/api/stream?url={SOURCE_QUERY}&type=dash");
    let response = get(&app.router, &uri).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(app.capture.opens(), 0);
}

#[tokio::test]
async fn test_unknown_routes_are_not_found() {
    let app = test_app();

    let response = get(&app.router, "/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = get(&app.router, "/hls/not-a-session/live.m3u8").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let id = SessionId::for_source(SOURCE).unwrap();
    let response = get(&app.router, &format!("/hls/{id}/live0.ts")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_fresh_hls_request_returns_manifest() {
    let app = test_app();

    let response = get(&app.router, &format!("/api/stream?url={SOURCE_QUERY}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/vnd.apple.mpegurl"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    let length: usize = response.headers()[header::CONTENT_LENGTH]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(length > 0);

    let body = body_string(response).await;
    assert_eq!(body, PLAYLIST);
    assert!(body.starts_with("#EXTM3U"));

    // Segments listed in the manifest are served from the session directory.
    let id = SessionId::for_source(SOURCE).unwrap();
    let response = get(&app.router, &format!("/hls/{id}/live0.ts")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp2t");
    assert_eq!(body_string(response).await, "segment-0");

    // A second viewer shares the session.
    let response = get(&app.router, &format!("/api/stream?url={SOURCE_QUERY}&type=hls")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.capture.opens(), 1);
    assert_eq!(app.transcoder.launches(), 1);

    app.registry.shutdown().await;
}

#[tokio::test]
async fn test_health_and_session_listing() {
    let app = test_app();

    let response = get(&app.router, "/api/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let health: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["live_sessions"], 0);

    let response = get(&app.router, &format!("/api/stream?url={SOURCE_QUERY}")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = get(&app.router, "/api/sessions").await;
    assert_eq!(response.status(), StatusCode::OK);
    let sessions: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    let sessions = sessions.as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["source_url"], SOURCE);
    assert_eq!(sessions[0]["mode"], "segmented");

    app.registry.shutdown().await;
}

#[tokio::test]
async fn test_continuous_client_disconnect_tears_down_session() {
    let app = test_app();

    let response = get(
        &app.router,
        &format!("/api/stream?url={SOURCE_QUERY}&type=fmp4"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");

    let session = app.registry.snapshot().pop().unwrap();
    let session = app.registry.get(&session.id).unwrap();

    let mut stream = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("first bytes in time")
        .unwrap()
        .unwrap();
    assert!(!first.is_empty());

    drop(stream);

    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .expect("session should close after the client left");
    assert_eq!(session.close_reason(), Some(CloseReason::ClientDisconnected));
    assert_eq!(app.transcoder.exits(), 1);
    assert!(eventually(Duration::from_secs(2), || app.capture.releases() == 1).await);
    assert!(eventually(Duration::from_secs(2), || app.registry.live_count() == 0).await);
}
