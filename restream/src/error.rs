//! Application-wide error types.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Readiness stage that failed to complete in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessStage {
    /// The capture source never reported a playable video signal.
    VideoSignal,
    /// The capture source never started delivering chunks.
    CaptureActive,
    /// The transcoder never produced a playlist with enough segments.
    SegmentOutput,
}

impl std::fmt::Display for ReadinessStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::VideoSignal => "video signal",
            Self::CaptureActive => "capture delivery",
            Self::SegmentOutput => "segment output",
        };
        f.write_str(name)
    }
}

/// Application-wide error type.
///
/// `Clone` so a single creation failure can be handed to every requester that
/// joined the same reservation.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Stream did not become ready: timed out waiting for {stage}")]
    ReadinessTimeout { stage: ReadinessStage },

    #[error("Stream {id} is not ready yet")]
    StreamNotReady { id: String },

    #[error("Transcoder exited unexpectedly (code: {code:?})")]
    ProcessTermination { code: Option<i32> },

    #[error("Capture source closed unexpectedly")]
    CaptureSourceLost,

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("Invalid playlist: {0}")]
    Playlist(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error while {op} {}: {source}", path.display())]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Service is shutting down")]
    Shutdown,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn spawn(program: impl Into<String>, err: &std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            message: err.to_string(),
        }
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source: Arc::new(source),
        }
    }

    pub fn readiness_timeout(stage: ReadinessStage) -> Self {
        Self::ReadinessTimeout { stage }
    }

    /// Whether the error means a file or session simply does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::IoPath { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            Self::Io(source) => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_timeout_message_names_stage() {
        let err = Error::readiness_timeout(ReadinessStage::SegmentOutput);
        assert_eq!(
            err.to_string(),
            "Stream did not become ready: timed out waiting for segment output"
        );
    }

    #[test]
    fn test_io_path_not_found_is_detected() {
        let err = Error::io_path(
            "reading",
            Path::new("/nope/live.m3u8"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.is_not_found());
        assert!(err.to_string().contains("/nope/live.m3u8"));

        let other = Error::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert!(!other.is_not_found());
    }

    #[test]
    fn test_errors_are_cloneable_for_waiters() {
        let err = Error::ProcessTermination { code: Some(1) };
        let shared = err.clone();
        assert_eq!(err.to_string(), shared.to_string());
    }
}
