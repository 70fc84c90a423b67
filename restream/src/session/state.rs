//! Session lifecycle states.

use serde::Serialize;

use crate::{Error, Result};

/// How a session's output reaches clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Disk-backed rolling HLS playlist, shared by any number of readers.
    Segmented,
    /// Fragmented MP4 piped to exactly one HTTP response.
    Continuous,
}

impl OutputMode {
    /// Parse the `type` query parameter.
    pub fn from_query(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hls" => Some(Self::Segmented),
            "fmp4" => Some(Self::Continuous),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Segmented => "hls",
            Self::Continuous => "fmp4",
        }
    }
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a stream session.
///
/// ```text
/// Reserved -> Initializing -> Ready -> Serving -> Draining -> Closed
///                  |            |                    ^
///                  +------------+--------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Reserved,
    Initializing,
    Ready,
    Serving,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Serving => "serving",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Reserved, Initializing)
                | (Reserved, Closed)
                | (Initializing, Ready)
                | (Initializing, Draining)
                | (Ready, Serving)
                | (Ready, Draining)
                | (Serving, Draining)
                | (Draining, Closed)
        )
    }

    /// Validated transition.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session left service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CloseReason {
    /// The single continuous-mode client went away.
    ClientDisconnected,
    /// The continuous-mode client stopped accepting bytes.
    ClientStalled,
    /// No segmented-mode reader for longer than the idle threshold.
    Idle,
    /// The capture source closed on its own.
    CaptureSourceLost,
    /// The transcoder exited on its own.
    TranscoderExited { code: Option<i32> },
    /// Initialization failed or timed out.
    InitializationFailed,
    /// Service shutdown.
    Shutdown,
}

impl CloseReason {
    /// Error reported to requesters still waiting for this session.
    pub fn to_error(self) -> Error {
        match self {
            Self::TranscoderExited { code } => Error::ProcessTermination { code },
            Self::Shutdown => Error::Shutdown,
            _ => Error::CaptureSourceLost,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientDisconnected => f.write_str("client disconnected"),
            Self::ClientStalled => f.write_str("client stalled"),
            Self::Idle => f.write_str("idle"),
            Self::CaptureSourceLost => f.write_str("capture source closed"),
            Self::TranscoderExited { code } => write!(f, "transcoder exited ({code:?})"),
            Self::InitializationFailed => f.write_str("initialization failed"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}
