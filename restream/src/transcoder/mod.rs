//! Transcoder processes fed from a capture source.

mod ffmpeg;
mod handle;

use std::path::PathBuf;

pub use ffmpeg::FfmpegLauncher;
pub use handle::{
    ExitReporter, TranscoderExit, TranscoderHandle, TranscoderInput, TranscoderOutput,
    TranscoderProcessSide, WriteOutcome,
};

use crate::Result;
use crate::session::{OutputMode, SessionId};

/// Everything a launcher needs to start one transcoder.
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub session_id: SessionId,
    pub mode: OutputMode,
    /// Directory receiving the playlist and segments (segmented mode).
    pub output_dir: PathBuf,
    pub playlist_name: String,
    /// Absolute URL prefix written in front of segment names.
    pub segment_base_url: String,
}

/// Starts transcoder processes.
pub trait TranscoderLauncher: Send + Sync {
    fn launch(&self, job: &TranscodeJob) -> Result<TranscoderHandle>;
}
