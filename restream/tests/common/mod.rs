//! In-process stand-ins for the capture helper and ffmpeg.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use restream::capture::{CaptureFeed, CaptureHandle, CaptureOptions, CaptureProvider};
use restream::config::SessionConfig;
use restream::session::{OutputMode, SessionRegistry};
use restream::transcoder::{
    TranscodeJob, TranscoderHandle, TranscoderLauncher, TranscoderOutput, TranscoderProcessSide,
};

pub const PLAYLIST: &str = "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:0\n#EXTINF:1.0,\nlive0.ts\n#EXTINF:1.0,\nlive1.ts\n";

/// Capture provider producing small chunks on a timer.
#[derive(Default)]
pub struct FakeCapture {
    pub opens: AtomicUsize,
    pub releases: Arc<AtomicUsize>,
    /// Never report a playable video.
    pub withhold_video: bool,
    /// Delay before the video is reported playable.
    pub video_delay: Duration,
    pub feeds: Mutex<Vec<CaptureFeed>>,
}

impl FakeCapture {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Simulate the page going away.
    pub fn close_all(&self) {
        for feed in self.feeds.lock().iter() {
            feed.close();
        }
    }
}

#[async_trait]
impl CaptureProvider for FakeCapture {
    async fn open(
        &self,
        _source_url: &str,
        _options: &CaptureOptions,
    ) -> restream::Result<CaptureHandle> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (feed, handle) = CaptureHandle::channel(16);
        self.feeds.lock().push(feed.clone());

        let releases = Arc::clone(&self.releases);
        let released = feed.clone();
        tokio::spawn(async move {
            released.close_requested().await;
            releases.fetch_add(1, Ordering::SeqCst);
        });

        let withhold_video = self.withhold_video;
        let video_delay = self.video_delay;
        tokio::spawn(async move {
            tokio::time::sleep(video_delay).await;
            if !withhold_video {
                feed.mark_video_ready();
            }
            loop {
                if !feed.push(Bytes::from_static(&[7u8; 100])).await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        Ok(handle)
    }
}

/// Transcoder launcher that never spawns a process.
///
/// Segmented jobs get a playlist and two segments after `segment_delay`.
/// Continuous jobs echo their input to the output stream.
#[derive(Default)]
pub struct FakeTranscoder {
    pub launches: AtomicUsize,
    pub exits: Arc<AtomicUsize>,
    pub segment_delay: Duration,
    pub kills: Mutex<Vec<CancellationToken>>,
}

impl FakeTranscoder {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn exits(&self) -> usize {
        self.exits.load(Ordering::SeqCst)
    }

    /// Simulate the process dying on its own.
    pub fn kill_all(&self) {
        for kill in self.kills.lock().iter() {
            kill.cancel();
        }
    }
}

impl TranscoderLauncher for FakeTranscoder {
    fn launch(&self, job: &TranscodeJob) -> restream::Result<TranscoderHandle> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (output, mut writer) = match job.mode {
            OutputMode::Continuous => {
                let (reader, writer) = tokio::io::duplex(64 * 1024);
                (Some(Box::new(reader) as TranscoderOutput), Some(writer))
            }
            OutputMode::Segmented => (None, None),
        };
        let (handle, TranscoderProcessSide { mut input, exit }) =
            TranscoderHandle::channel(16, output);

        let kill = CancellationToken::new();
        self.kills.lock().push(kill.clone());

        let exits = Arc::clone(&self.exits);
        let segmented = (job.mode == OutputMode::Segmented)
            .then(|| (job.output_dir.clone(), job.playlist_name.clone()));
        let delay = self.segment_delay;

        tokio::spawn(async move {
            if let Some((dir, playlist)) = segmented {
                tokio::time::sleep(delay).await;
                write_segments(&dir, &playlist).await;
            }

            let code = loop {
                tokio::select! {
                    _ = exit.terminate_token().cancelled() => break Some(0),
                    _ = kill.cancelled() => break Some(137),
                    chunk = input.recv() => match chunk {
                        Some(chunk) => {
                            if let Some(writer) = writer.as_mut() {
                                let _ = writer.write_all(&chunk).await;
                            }
                        }
                        None => break Some(0),
                    },
                }
            };

            exits.fetch_add(1, Ordering::SeqCst);
            exit.report_exit(code);
        });

        Ok(handle)
    }
}

async fn write_segments(dir: &Path, playlist: &str) {
    let _ = tokio::fs::write(dir.join("live0.ts"), b"segment-0").await;
    let _ = tokio::fs::write(dir.join("live1.ts"), b"segment-1").await;
    let _ = tokio::fs::write(dir.join(playlist), PLAYLIST).await;
}

pub fn test_config(root: &Path) -> SessionConfig {
    SessionConfig {
        output_root: root.to_path_buf(),
        video_bitrate: 8_000,
        ready_timeout: Duration::from_secs(5),
        reservation_timeout: Duration::from_secs(5),
        readiness_poll_interval: Duration::from_millis(10),
        idle_timeout: Duration::from_millis(200),
        sweep_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

pub fn registry(
    capture: Arc<FakeCapture>,
    transcoder: Arc<FakeTranscoder>,
    config: SessionConfig,
) -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(
        capture,
        transcoder,
        config,
        "http://127.0.0.1:3001",
    ))
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
