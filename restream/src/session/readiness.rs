//! Segmented output readiness probing.

use std::path::Path;
use std::time::Duration;

use m3u8_rs::Playlist;
use tracing::trace;

use crate::error::ReadinessStage;
use crate::utils::fs;
use crate::{Error, Result};

/// Extension of the media segments the segmented transcoder writes.
const SEGMENT_EXTENSION: &str = ".ts";

/// Snapshot of a session's output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputProbe {
    pub playlist_valid: bool,
    pub segments: usize,
}

impl OutputProbe {
    pub fn is_ready(&self, min_segments: usize) -> bool {
        self.playlist_valid && self.segments >= min_segments
    }
}

/// Parse `bytes` as a media playlist.
pub fn parse_media_playlist(bytes: &[u8]) -> Result<m3u8_rs::MediaPlaylist> {
    match m3u8_rs::parse_playlist_res(bytes) {
        Ok(Playlist::MediaPlaylist(playlist)) => Ok(playlist),
        Ok(Playlist::MasterPlaylist(_)) => Err(Error::Playlist(
            "Expected Media Playlist, got Master".to_string(),
        )),
        Err(e) => Err(Error::Playlist(format!(
            "Failed to parse media playlist: {e}"
        ))),
    }
}

/// Inspect the output directory once.
pub async fn probe_output(dir: &Path, playlist_name: &str) -> Result<OutputProbe> {
    let names = fs::list_file_names(dir).await?;
    let segments = names
        .iter()
        .filter(|name| name.ends_with(SEGMENT_EXTENSION))
        .count();

    let playlist_valid = if names.iter().any(|name| name == playlist_name) {
        match fs::read(&dir.join(playlist_name)).await {
            Ok(bytes) => parse_media_playlist(&bytes).is_ok(),
            // ffmpeg replaces the playlist atomically; a vanished file is retried.
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        }
    } else {
        false
    };

    Ok(OutputProbe {
        playlist_valid,
        segments,
    })
}

/// Poll the output directory until the playlist parses and enough segments exist.
pub async fn wait_for_segments(
    dir: &Path,
    playlist_name: &str,
    min_segments: usize,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let poll = async {
        loop {
            let probe = probe_output(dir, playlist_name).await?;
            trace!(dir = %dir.display(), ?probe, "Probed segment output");
            if probe.is_ready(min_segments) {
                return Ok(());
            }
            tokio::time::sleep(poll_interval).await;
        }
    };

    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| Error::readiness_timeout(ReadinessStage::SegmentOutput))?
}
