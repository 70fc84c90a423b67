//! Capture source handle and its producer-side counterpart.

use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::ReadinessStage;
use crate::{Error, Result};

/// Chunks a producer may queue before it has to wait for the session.
pub const DEFAULT_CHUNK_QUEUE: usize = 64;

/// Readiness probes reported by a capture source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSignals {
    /// The page has a playable video element.
    pub video_ready: bool,
    /// Media chunk delivery has started.
    pub capture_active: bool,
}

/// Session-side handle to a capture source.
///
/// Closing is idempotent and observable from both sides: the session closes the
/// handle to stop the producer, and the producer closes it when the page goes away.
pub struct CaptureHandle {
    chunks: Mutex<Option<mpsc::Receiver<Bytes>>>,
    signals: watch::Receiver<CaptureSignals>,
    closed: CancellationToken,
}

/// Producer-side half of a capture source.
#[derive(Clone)]
pub struct CaptureFeed {
    chunks: mpsc::Sender<Bytes>,
    signals: watch::Sender<CaptureSignals>,
    closed: CancellationToken,
}

impl CaptureHandle {
    /// Create a connected producer/handle pair.
    pub fn channel(queue: usize) -> (CaptureFeed, CaptureHandle) {
        let (chunk_tx, chunk_rx) = mpsc::channel(queue.max(1));
        let (signal_tx, signal_rx) = watch::channel(CaptureSignals::default());
        let closed = CancellationToken::new();

        let feed = CaptureFeed {
            chunks: chunk_tx,
            signals: signal_tx,
            closed: closed.clone(),
        };
        let handle = CaptureHandle {
            chunks: Mutex::new(Some(chunk_rx)),
            signals: signal_rx,
            closed,
        };
        (feed, handle)
    }

    /// Take the chunk stream. Only the first call gets it.
    pub fn take_chunks(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.chunks.lock().take()
    }

    /// Wait until the source reports a playable video.
    pub async fn wait_video_ready(&self, timeout: Duration) -> Result<()> {
        self.wait_signal(|s| s.video_ready, ReadinessStage::VideoSignal, timeout)
            .await
    }

    /// Wait until the source reports active chunk delivery.
    pub async fn wait_capture_active(&self, timeout: Duration) -> Result<()> {
        self.wait_signal(|s| s.capture_active, ReadinessStage::CaptureActive, timeout)
            .await
    }

    async fn wait_signal(
        &self,
        predicate: impl Fn(&CaptureSignals) -> bool,
        stage: ReadinessStage,
        timeout: Duration,
    ) -> Result<()> {
        let mut signals = self.signals.clone();
        let wait = async {
            tokio::select! {
                biased;
                result = signals.wait_for(|s| predicate(s)) => {
                    result.map(|_| ()).map_err(|_| Error::CaptureSourceLost)
                }
                _ = self.closed.cancelled() => Err(Error::CaptureSourceLost),
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::readiness_timeout(stage))?
    }

    /// Ask the producer to stop. Safe to call any number of times.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the source is closed, by either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl CaptureFeed {
    /// Deliver one chunk. Returns `false` once the session stopped listening.
    pub async fn push(&self, chunk: Bytes) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        self.mark_capture_active();
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => false,
            sent = self.chunks.send(chunk) => sent.is_ok(),
        }
    }

    pub fn mark_video_ready(&self) {
        self.signals.send_if_modified(|s| !std::mem::replace(&mut s.video_ready, true));
    }

    pub fn mark_capture_active(&self) {
        self.signals
            .send_if_modified(|s| !std::mem::replace(&mut s.capture_active, true));
    }

    /// Report that the source went away.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once either side closed the source.
    pub async fn close_requested(&self) {
        self.closed.cancelled().await
    }
}
