//! Capture sources: producers of raw media chunks from a rendered page.
//!
//! The page automation itself lives outside this crate. A provider opens a
//! source for a URL and hands back a [`CaptureHandle`] the session owns.

mod handle;
mod process;

use async_trait::async_trait;

pub use handle::{CaptureFeed, CaptureHandle, CaptureSignals, DEFAULT_CHUNK_QUEUE};
pub use process::{CaptureStatus, ProcessCaptureProvider, parse_capture_status};

use crate::Result;
use crate::session::SessionId;

/// Parameters passed to a capture provider.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Session the source is opened for.
    pub session_id: SessionId,
    /// Target bitrate hint for the in-page recorder, bits per second.
    pub video_bitrate: u64,
}

/// Opens capture sources.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    /// Open a capture source rendering `source_url`.
    async fn open(&self, source_url: &str, options: &CaptureOptions) -> Result<CaptureHandle>;
}
