//! One capture -> transcode -> serve pipeline.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::feed::{self, PacingConfig};
use super::{CloseReason, OutputMode, SessionId, SessionState};
use crate::capture::CaptureHandle;
use crate::config::SessionConfig;
use crate::transcoder::TranscoderHandle;
use crate::utils::fs;

/// Upper bound on waiting for the transcoder during teardown.
const TEARDOWN_WAIT: Duration = Duration::from_secs(10);

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub mode: OutputMode,
    pub state: SessionState,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    pub idle_secs: f64,
}

/// A live pipeline binding one capture source to one transcoder.
///
/// The session exclusively owns both handles. Whichever side ends first
/// (capture close, transcoder exit, or an explicit drain) triggers a single
/// teardown that releases the other.
pub struct StreamSession {
    id: SessionId,
    source_url: String,
    mode: OutputMode,
    output_dir: PathBuf,
    created_at: DateTime<Utc>,
    last_visit: Mutex<Instant>,
    state: Mutex<SessionState>,
    capture: CaptureHandle,
    transcoder: TranscoderHandle,
    close_reason: OnceLock<CloseReason>,
    /// Cancelled to start draining.
    drain: CancellationToken,
    /// Cancelled once resources are released.
    closed: CancellationToken,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("source_url", &self.source_url)
            .field("close_reason", &self.close_reason())
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    /// Wire a freshly acquired capture source into a freshly spawned transcoder.
    ///
    /// Starts chunk delivery and the supervisor that owns teardown. The session
    /// begins in `Initializing`.
    pub fn start(
        id: SessionId,
        source_url: String,
        mode: OutputMode,
        output_dir: PathBuf,
        capture: CaptureHandle,
        transcoder: TranscoderHandle,
        config: &SessionConfig,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            id,
            source_url,
            mode,
            output_dir,
            created_at: Utc::now(),
            last_visit: Mutex::new(Instant::now()),
            state: Mutex::new(SessionState::Initializing),
            capture,
            transcoder,
            close_reason: OnceLock::new(),
            drain: CancellationToken::new(),
            closed: CancellationToken::new(),
        });

        info!(session_id = %session.id, mode = %mode, "[+] create");

        session.spawn_feed(config);
        tokio::spawn(Arc::clone(&session).supervise());
        session
    }

    fn spawn_feed(&self, config: &SessionConfig) {
        let Some(chunks) = self.capture.take_chunks() else {
            warn!(session_id = %self.id, "Capture chunks already taken");
            return;
        };
        let input = self.transcoder.input();
        let stop = self.drain.clone();
        let session_id = self.id.to_string();

        match self.mode {
            OutputMode::Segmented => {
                tokio::spawn(async move {
                    let stats = feed::run_direct_feed(chunks, input, stop).await;
                    debug!(session_id = %session_id, ?stats, "Chunk feed stopped");
                });
            }
            OutputMode::Continuous => {
                let pacing = PacingConfig {
                    bitrate: config.video_bitrate,
                    window: config.prebuffer_window(),
                    capacity: config.buffer_capacity(),
                    recheck: config.drain_recheck_interval,
                    pacing: config.drain_pacing,
                };
                tokio::spawn(async move {
                    let stats =
                        feed::run_paced_feed(chunks, input, stop, pacing, &session_id).await;
                    debug!(session_id = %session_id, ?stats, "Chunk feed stopped");
                });
            }
        }
    }

    /// Wait for the first termination trigger, then tear down exactly once.
    async fn supervise(self: Arc<Self>) {
        let trigger = tokio::select! {
            _ = self.drain.cancelled() => None,
            _ = self.capture.closed() => Some(CloseReason::CaptureSourceLost),
            exit = self.transcoder.exited() => Some(CloseReason::TranscoderExited { code: exit.code }),
        };
        if let Some(reason) = trigger {
            self.drain(reason);
        }

        self.teardown().await;
    }

    async fn teardown(&self) {
        self.transcoder.terminate();
        self.capture.close();

        if tokio::time::timeout(TEARDOWN_WAIT, self.transcoder.exited())
            .await
            .is_err()
        {
            warn!(session_id = %self.id, "Transcoder did not report exit during teardown");
        }

        if self.mode == OutputMode::Segmented
            && let Err(e) = fs::remove_dir_all_if_exists(&self.output_dir).await
        {
            warn!(session_id = %self.id, error = %e, "Failed to remove output directory");
        }

        {
            let mut state = self.state.lock();
            if let Err(e) = state.transition(SessionState::Closed) {
                warn!(session_id = %self.id, error = %e, "Unexpected state at teardown");
                *state = SessionState::Closed;
            }
        }

        info!(
            session_id = %self.id,
            reason = %self.close_reason().unwrap_or(CloseReason::Shutdown),
            "[-] closed"
        );
        self.closed.cancel();
    }

    /// Start draining. Only the first call records its reason; returns whether it did.
    pub fn drain(&self, reason: CloseReason) -> bool {
        if self.close_reason.set(reason).is_err() {
            return false;
        }

        {
            let mut state = self.state.lock();
            if state.can_transition_to(SessionState::Draining) {
                let _ = state.transition(SessionState::Draining);
            }
        }

        debug!(session_id = %self.id, reason = %reason, "Draining session");
        self.drain.cancel();
        true
    }

    /// `Initializing -> Ready`.
    pub fn mark_ready(&self) -> crate::Result<()> {
        self.state.lock().transition(SessionState::Ready)?;
        info!(session_id = %self.id, "[=] ready");
        Ok(())
    }

    /// `Ready -> Serving` on the first client read. Later calls are no-ops.
    pub fn mark_serving(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Ready {
            let _ = state.transition(SessionState::Serving);
        }
    }

    /// Record a client access.
    pub fn touch(&self) {
        *self.last_visit.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_visit.lock().elapsed()
    }

    /// Resolves once all resources are released.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn capture(&self) -> &CaptureHandle {
        &self.capture
    }

    pub fn transcoder(&self) -> &TranscoderHandle {
        &self.transcoder
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            mode: self.mode,
            state: self.state(),
            source_url: self.source_url.clone(),
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs_f64(),
        }
    }
}
