//! Session registry integration tests.
//!
//! These drive the registry end to end with in-process capture and
//! transcoder stand-ins: creation dedup, failure propagation, teardown
//! and idle eviction.

mod common;

use std::sync::Arc;
use std::time::Duration;

use restream::Error;
use restream::error::ReadinessStage;
use restream::session::{CloseReason, OutputMode, SessionState};

use common::{FakeCapture, FakeTranscoder, eventually, registry, test_config};

const SOURCE: &str = "https://example.com/live/page";

#[tokio::test]
async fn test_concurrent_requests_share_one_session() {
    let dir = tempfile::tempdir().unwrap();
    let capture = Arc::new(FakeCapture::default());
    let transcoder = Arc::new(FakeTranscoder {
        segment_delay: Duration::from_millis(100),
        ..Default::default()
    });
    let registry = registry(capture.clone(), transcoder.clone(), test_config(dir.path()));

    let opens = (0..8).map(|_| {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.open(SOURCE, OutputMode::Segmented).await })
    });
    let sessions: Vec<_> = futures::future::join_all(opens)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let first = &sessions[0];
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, first)));
    assert_eq!(capture.opens(), 1);
    assert_eq!(transcoder.launches(), 1);
    assert_eq!(first.state(), SessionState::Ready);
    assert_eq!(registry.live_count(), 1);
    assert_eq!(registry.reserved_count(), 0);

    // A later request is served from the live entry.
    let again = registry.open(SOURCE, OutputMode::Segmented).await.unwrap();
    assert!(Arc::ptr_eq(&again, first));
    assert_eq!(capture.opens(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_failed_creation_reaches_every_waiter() {
    let dir = tempfile::tempdir().unwrap();
    let capture = Arc::new(FakeCapture {
        withhold_video: true,
        ..Default::default()
    });
    let transcoder = Arc::new(FakeTranscoder::default());
    let mut config = test_config(dir.path());
    config.ready_timeout = Duration::from_millis(300);
    let registry = registry(capture.clone(), transcoder.clone(), config);

    let opens = (0..4).map(|_| {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.open(SOURCE, OutputMode::Segmented).await })
    });
    let results = futures::future::join_all(opens).await;

    for result in results {
        let err = result.unwrap().unwrap_err();
        assert!(
            matches!(
                err,
                Error::ReadinessTimeout {
                    stage: ReadinessStage::VideoSignal
                }
            ),
            "unexpected error: {err:?}"
        );
    }
    assert_eq!(capture.opens(), 1);

    // Resources of the failed attempt are released and the id is free again.
    assert!(eventually(Duration::from_secs(2), || capture.releases() == 1).await);
    assert!(eventually(Duration::from_secs(2), || transcoder.exits() == 1).await);
    assert!(
        eventually(Duration::from_secs(2), || registry.live_count() == 0
            && registry.reserved_count() == 0)
        .await
    );

    let retry = registry.open(SOURCE, OutputMode::Segmented).await;
    assert!(retry.is_err());
    assert_eq!(capture.opens(), 2);
}

#[tokio::test]
async fn test_teardown_runs_once_when_both_sides_fail() {
    let dir = tempfile::tempdir().unwrap();
    let capture = Arc::new(FakeCapture::default());
    let transcoder = Arc::new(FakeTranscoder::default());
    let registry = registry(capture.clone(), transcoder.clone(), test_config(dir.path()));

    let session = registry.open(SOURCE, OutputMode::Segmented).await.unwrap();
    let output_dir = session.output_dir().to_path_buf();
    assert!(output_dir.join("live.m3u8").exists());

    // Page navigation and a transcoder crash at the same moment.
    capture.close_all();
    transcoder.kill_all();

    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .expect("session should close");

    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        session.close_reason(),
        Some(CloseReason::CaptureSourceLost | CloseReason::TranscoderExited { .. })
    ));
    assert_eq!(transcoder.exits(), 1);
    assert!(!output_dir.exists());

    assert!(eventually(Duration::from_secs(2), || registry.get(session.id()).is_none()).await);
    assert_eq!(registry.live_count(), 0);

    // A fresh request builds a new session rather than reusing the dead one.
    let fresh = registry.open(SOURCE, OutputMode::Segmented).await.unwrap();
    assert!(!Arc::ptr_eq(&fresh, &session));
    assert_eq!(capture.opens(), 2);

    registry.shutdown().await;
}

#[tokio::test]
async fn test_idle_sweep_evicts_only_unvisited_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let capture = Arc::new(FakeCapture::default());
    let transcoder = Arc::new(FakeTranscoder::default());
    let mut config = test_config(dir.path());
    config.idle_timeout = Duration::from_millis(300);
    let registry = registry(capture.clone(), transcoder.clone(), config);

    let idle = registry
        .open("https://example.com/a", OutputMode::Segmented)
        .await
        .unwrap();
    let visited = registry
        .open("https://example.com/b", OutputMode::Segmented)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    visited.touch();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(registry.sweep_idle(), 1);
    tokio::time::timeout(Duration::from_secs(5), idle.closed())
        .await
        .expect("idle session should close");
    assert_eq!(idle.close_reason(), Some(CloseReason::Idle));
    assert!(!visited.is_closed());

    assert!(eventually(Duration::from_secs(2), || registry.live_count() == 1).await);

    registry.shutdown().await;
    assert!(visited.is_closed());
    assert_eq!(visited.close_reason(), Some(CloseReason::Shutdown));
}

#[tokio::test]
async fn test_continuous_requests_get_their_own_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let capture = Arc::new(FakeCapture::default());
    let transcoder = Arc::new(FakeTranscoder::default());
    let registry = registry(capture.clone(), transcoder.clone(), test_config(dir.path()));

    let a = registry.open(SOURCE, OutputMode::Continuous).await.unwrap();
    let b = registry.open(SOURCE, OutputMode::Continuous).await.unwrap();

    assert_ne!(a.id(), b.id());
    assert_eq!(capture.opens(), 2);
    assert!(a.transcoder().take_output().is_some());

    registry.shutdown().await;
    assert!(a.is_closed() && b.is_closed());
    assert_eq!(transcoder.exits(), 2);
}

#[tokio::test]
async fn test_abandoned_continuous_request_releases_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let capture = Arc::new(FakeCapture {
        video_delay: Duration::from_millis(300),
        ..Default::default()
    });
    let transcoder = Arc::new(FakeTranscoder::default());
    let registry = registry(capture.clone(), transcoder.clone(), test_config(dir.path()));

    let request = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.open(SOURCE, OutputMode::Continuous).await })
    };
    assert!(eventually(Duration::from_secs(2), || capture.opens() == 1).await);

    // The client goes away while the stream is still initializing.
    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());

    assert!(eventually(Duration::from_secs(3), || transcoder.exits() == 1).await);
    assert!(eventually(Duration::from_secs(2), || capture.releases() == 1).await);
    assert!(
        eventually(Duration::from_secs(2), || registry.live_count() == 0
            && registry.reserved_count() == 0)
        .await
    );
}

#[tokio::test]
async fn test_requests_after_shutdown_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let registry = registry(
        Arc::new(FakeCapture::default()),
        Arc::new(FakeTranscoder::default()),
        test_config(dir.path()),
    );

    registry.shutdown().await;
    let err = registry
        .open(SOURCE, OutputMode::Segmented)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Shutdown));
}
