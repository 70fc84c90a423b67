//! Capture provider backed by an external helper process.
//!
//! The helper is started as `<command> <source-url>` with `VIDEO_BITRATE` in its
//! environment. It writes raw media bytes to stdout and reports progress on
//! stderr with the markers `video-ready` and `capture-ready`. Closing its stdin
//! asks it to stop.

use std::process::Stdio;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{debug, error, info, warn};

use super::{CaptureHandle, CaptureOptions, CaptureProvider, DEFAULT_CHUNK_QUEUE};
use crate::config::CaptureConfig;
use crate::{Error, Result};

/// Read size for the helper's stdout.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Status parsed from a helper stderr line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureStatus {
    VideoReady,
    CaptureReady,
    Error(String),
}

/// Parse one helper stderr line.
pub fn parse_capture_status(line: &str) -> Option<CaptureStatus> {
    let trimmed = line.trim();
    if trimmed.eq_ignore_ascii_case("video-ready") {
        return Some(CaptureStatus::VideoReady);
    }
    if trimmed.eq_ignore_ascii_case("capture-ready") {
        return Some(CaptureStatus::CaptureReady);
    }
    if trimmed.to_ascii_lowercase().contains("error") {
        return Some(CaptureStatus::Error(trimmed.to_string()));
    }
    None
}

/// Runs one helper process per capture source.
pub struct ProcessCaptureProvider {
    config: CaptureConfig,
}

impl ProcessCaptureProvider {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CaptureProvider for ProcessCaptureProvider {
    async fn open(&self, source_url: &str, options: &CaptureOptions) -> Result<CaptureHandle> {
        let session_id = options.session_id.to_string();

        let mut command = process_utils::tokio_command(&self.config.command);
        command
            .arg(source_url)
            .env("VIDEO_BITRATE", options.video_bitrate.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command
            .spawn()
            .map_err(|e| Error::spawn(&self.config.command, &e))?;

        let stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::config("Failed to capture helper stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::config("Failed to capture helper stderr"))?;

        info!(session_id = %session_id, command = %self.config.command, "Capture helper started");

        let (feed, handle) = CaptureHandle::channel(DEFAULT_CHUNK_QUEUE);

        // stdout -> chunk channel
        let chunk_feed = feed.clone();
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE);
            loop {
                buf.reserve(READ_CHUNK_SIZE);
                tokio::select! {
                    _ = chunk_feed.close_requested() => break,
                    read = stdout.read_buf(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(_) => {
                            if !chunk_feed.push(buf.split().freeze()).await {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to read capture helper stdout");
                            break;
                        }
                    }
                }
            }
        });

        // stderr -> readiness signals
        let status_feed = feed.clone();
        let status_id = session_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            loop {
                tokio::select! {
                    _ = status_feed.close_requested() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match parse_capture_status(&line) {
                            Some(CaptureStatus::VideoReady) => status_feed.mark_video_ready(),
                            Some(CaptureStatus::CaptureReady) => status_feed.mark_capture_active(),
                            Some(CaptureStatus::Error(msg)) => {
                                warn!(session_id = %status_id, "Capture helper error: {}", msg);
                            }
                            None => debug!(session_id = %status_id, "capture: {}", line),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            error!(session_id = %status_id, error = %e, "Error reading capture helper stderr");
                            break;
                        }
                    }
                }
            }
        });

        // Lifetime: helper exit closes the source, closing the source stops the helper.
        let grace = self.config.stop_grace;
        tokio::spawn(async move {
            let mut stdin = stdin;
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => info!(session_id = %session_id, code = ?status.code(), "Capture helper exited"),
                        Err(e) => error!(session_id = %session_id, error = %e, "Error waiting for capture helper"),
                    }
                }
                _ = feed.close_requested() => {
                    debug!(session_id = %session_id, "Stopping capture helper");
                    drop(stdin.take());
                    match process_utils::stop_child(&mut child, grace).await {
                        Ok(outcome) => debug!(session_id = %session_id, ?outcome, "Capture helper stopped"),
                        Err(e) => warn!(session_id = %session_id, error = %e, "Failed to stop capture helper"),
                    }
                }
            }
            feed.close();
        });

        Ok(handle)
    }
}
