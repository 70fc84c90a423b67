//! Environment-driven configuration.
//!
//! Every setting has a default; a `.env` file is honoured when present.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use crate::api::server::ApiServerConfig;
use crate::session::window_capacity;

/// Settings for the external transcoder process.
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    /// Path to the ffmpeg binary.
    pub binary_path: String,
    /// How long a stopping transcoder may take to flush before it is killed.
    pub stop_grace: Duration,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            binary_path: "ffmpeg".to_string(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Settings for the capture helper process.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Helper binary that renders the page and writes media chunks to stdout.
    pub command: String,
    /// How long a closing helper may take before it is killed.
    pub stop_grace: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            command: "restream-capture".to_string(),
            stop_grace: Duration::from_secs(3),
        }
    }
}

/// Session orchestration settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Root directory for segmented output; each session owns `<root>/<id>`.
    pub output_root: PathBuf,
    /// Manifest file name written by the segmented transcoder.
    pub playlist_name: String,
    /// Target bitrate in bits per second.
    pub video_bitrate: u64,
    /// Continuous-mode pre-buffer and target buffering window, in seconds.
    pub buffer_secs: f64,
    /// Chunk buffer capacity multiplier over the buffering window.
    pub buffer_safety_factor: f64,
    /// Timeout applied to each readiness stage independently.
    pub ready_timeout: Duration,
    /// How long a request joining an in-flight creation waits for it.
    pub reservation_timeout: Duration,
    /// Segmented sessions unvisited for longer than this are evicted.
    pub idle_timeout: Duration,
    /// Period of the idle sweep.
    pub sweep_interval: Duration,
    /// Continuous clients that accept no bytes for this long are dropped.
    pub client_stall_timeout: Duration,
    /// Poll interval for the segmented output directory.
    pub readiness_poll_interval: Duration,
    /// Minimum number of media segments before a segmented session is ready.
    pub min_segments: usize,
    /// Re-check interval of the drain loop while the buffer is below the window.
    pub drain_recheck_interval: Duration,
    /// Delay between two paced writes of the drain loop.
    pub drain_pacing: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("./hls"),
            playlist_name: "live.m3u8".to_string(),
            video_bitrate: 4_000_000,
            buffer_secs: 0.2,
            buffer_safety_factor: 2.0,
            ready_timeout: Duration::from_secs(30),
            reservation_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(10),
            client_stall_timeout: Duration::from_secs(30),
            readiness_poll_interval: Duration::from_millis(100),
            min_segments: 2,
            drain_recheck_interval: Duration::from_millis(50),
            drain_pacing: Duration::from_millis(100),
        }
    }
}

impl SessionConfig {
    /// Capacity of a continuous session's chunk buffer, in bytes.
    pub fn buffer_capacity(&self) -> usize {
        window_capacity(self.buffer_secs, self.video_bitrate, self.buffer_safety_factor)
    }

    /// The pre-buffer window as a duration.
    pub fn prebuffer_window(&self) -> Duration {
        Duration::try_from_secs_f64(self.buffer_secs.max(0.0)).unwrap_or(Duration::ZERO)
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub server: ApiServerConfig,
    pub transcoder: TranscoderConfig,
    pub capture: CaptureConfig,
    pub session: SessionConfig,
    /// Directory for rolling log files; console only when unset.
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        config.server = ApiServerConfig::from_env_or_default();

        if let Some(path) = env_string("FFMPEG_PATH") {
            config.transcoder.binary_path = path;
        }
        if let Some(command) = env_string("CAPTURE_COMMAND") {
            config.capture.command = command;
        }

        let session = &mut config.session;
        if let Some(dir) = env_string("HLS_DIR") {
            session.output_root = PathBuf::from(dir);
        }
        session.video_bitrate =
            env_parse_valid("VIDEO_BITRATE", session.video_bitrate, |bitrate| *bitrate > 0);
        session.buffer_secs = env_parse_valid("BUFFER_SEC", session.buffer_secs, |secs| {
            secs.is_finite() && *secs >= 0.0
        });
        session.ready_timeout = env_secs("READY_TIMEOUT_SECS", session.ready_timeout);
        session.reservation_timeout =
            env_secs("RESERVATION_TIMEOUT_SECS", session.reservation_timeout);
        session.idle_timeout = env_secs("IDLE_TIMEOUT_SECS", session.idle_timeout);
        session.sweep_interval = env_secs("SWEEP_INTERVAL_SECS", session.sweep_interval);
        session.client_stall_timeout =
            env_secs("CLIENT_STALL_TIMEOUT_SECS", session.client_stall_timeout);

        config.log_dir = env_string("LOG_DIR").map(PathBuf::from);

        config
    }

    /// Log the effective configuration.
    pub fn log(&self) {
        info!(ffmpeg_path = %self.transcoder.binary_path, "config");
        info!(capture_command = %self.capture.command, "config");
        info!(
            bind = %self.server.bind_address,
            port = self.server.port,
            public_base = %self.server.public_base_url(),
            "config"
        );
        info!(
            video_bitrate = self.session.video_bitrate,
            buffer_secs = self.session.buffer_secs,
            output_root = %self.session.output_root.display(),
            "config"
        );
    }
}

pub(crate) fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn env_parse<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env_string(key) {
        Some(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, value = %raw, "Invalid value in environment, using default");
                default
            }
        },
        None => default,
    }
}

/// Like [`env_parse`], also rejecting values `valid` refuses.
fn env_parse_valid<T: FromStr + Copy + std::fmt::Display>(
    key: &str,
    default: T,
    valid: impl Fn(&T) -> bool,
) -> T {
    let value = env_parse(key, default);
    if valid(&value) {
        value
    } else {
        warn!(key, %value, "Out of range value in environment, using default");
        default
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    let secs = env_parse(key, default.as_secs_f64());
    if secs.is_finite() && secs >= 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        default
    }
}
