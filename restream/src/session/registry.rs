//! Session registry: request deduplication, creation and idle eviction.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::readiness;
use super::stream::{SessionInfo, StreamSession};
use super::{CloseReason, OutputMode, SessionId};
use crate::capture::{CaptureOptions, CaptureProvider};
use crate::config::SessionConfig;
use crate::error::ReadinessStage;
use crate::transcoder::{TranscodeJob, TranscoderLauncher};
use crate::utils::fs;
use crate::{Error, Result};

/// Outcome of an in-flight creation, observed by everyone who asked for it.
#[derive(Clone)]
enum Creation {
    Pending,
    Ready(Arc<StreamSession>),
    Failed(Error),
}

enum Entry {
    /// Creation in flight.
    Reserved(watch::Receiver<Creation>),
    Live(Arc<StreamSession>),
}

/// Owns the mapping from session id to session.
///
/// Every request for a source converges on one session: the first request
/// reserves the id, later ones wait for that reservation to resolve. The
/// registry owns entry lifecycle, not the resources inside a session.
pub struct SessionRegistry {
    entries: DashMap<SessionId, Entry>,
    capture: Arc<dyn CaptureProvider>,
    launcher: Arc<dyn TranscoderLauncher>,
    config: SessionConfig,
    /// Public base URL segment links are built from, e.g. `http://127.0.0.1:3001`.
    public_base_url: String,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(
        capture: Arc<dyn CaptureProvider>,
        launcher: Arc<dyn TranscoderLauncher>,
        config: SessionConfig,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            capture,
            launcher,
            config,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session serving `source_url` in `mode`.
    ///
    /// Segmented sessions are shared per source. Continuous sessions serve one
    /// response each, so every call creates a new one.
    pub async fn open(
        self: &Arc<Self>,
        source_url: &str,
        mode: OutputMode,
    ) -> Result<Arc<StreamSession>> {
        let id = match mode {
            OutputMode::Segmented => SessionId::for_source(source_url)?,
            OutputMode::Continuous => SessionId::exclusive_for_source(source_url)?,
        };
        self.get_or_create(id, source_url, mode).await
    }

    /// Return the live session for `id`, join its creation, or create it.
    pub async fn get_or_create(
        self: &Arc<Self>,
        id: SessionId,
        source_url: &str,
        mode: OutputMode,
    ) -> Result<Arc<StreamSession>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }

        // Check-then-insert under the shard lock; nothing here awaits.
        let (creation, creator) = match self.entries.entry(id.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let joined = match occupied.get() {
                    Entry::Live(session) if !session.is_closed() => {
                        session.touch();
                        return Ok(Arc::clone(session));
                    }
                    Entry::Reserved(creation) => Some(creation.clone()),
                    // Closed but not yet reaped; never reused.
                    Entry::Live(_) => None,
                };
                match joined {
                    Some(creation) => (creation, None),
                    None => {
                        let (tx, rx) = watch::channel(Creation::Pending);
                        occupied.insert(Entry::Reserved(rx.clone()));
                        (rx, Some(tx))
                    }
                }
            }
            MapEntry::Vacant(vacant) => {
                let (tx, rx) = watch::channel(Creation::Pending);
                vacant.insert(Entry::Reserved(rx.clone()));
                (rx, Some(tx))
            }
        };

        match creator {
            Some(tx) => {
                debug!(session_id = %id, "Reserved session");
                // Runs detached so a dropped request cannot strand the reservation.
                let registry = Arc::clone(self);
                let source_url = source_url.to_string();
                tokio::spawn(async move { registry.create(id, source_url, mode, tx).await });
                // Creation is bounded by the readiness timeouts.
                let guard = AbandonedCreation::new(&creation, mode);
                let result = wait_for_creation(creation).await;
                guard.disarm();
                result
            }
            None => {
                debug!(session_id = %id, "Joining in-flight creation");
                tokio::time::timeout(self.config.reservation_timeout, wait_for_creation(creation))
                    .await
                    .map_err(|_| Error::StreamNotReady { id: id.to_string() })?
            }
        }
    }

    async fn create(
        self: Arc<Self>,
        id: SessionId,
        source_url: String,
        mode: OutputMode,
        tx: watch::Sender<Creation>,
    ) {
        match self.initialize(&id, &source_url, mode).await {
            Ok(session) => {
                self.entries
                    .insert(id.clone(), Entry::Live(Arc::clone(&session)));
                self.spawn_reaper(Arc::clone(&session));
                tx.send_replace(Creation::Ready(Arc::clone(&session)));
                // A continuous session exists for one response; nobody left to serve.
                if mode == OutputMode::Continuous && tx.is_closed() {
                    info!(session_id = %id, "Requester left before the stream was ready");
                    session.drain(CloseReason::ClientDisconnected);
                }
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Session creation failed");
                self.entries
                    .remove_if(&id, |_, entry| matches!(entry, Entry::Reserved(_)));
                tx.send_replace(Creation::Failed(e));
            }
        }
    }

    /// Acquire the capture source, spawn the transcoder and wait for readiness.
    async fn initialize(
        &self,
        id: &SessionId,
        source_url: &str,
        mode: OutputMode,
    ) -> Result<Arc<StreamSession>> {
        let output_dir = self.config.output_root.join(id.as_str());
        if mode == OutputMode::Segmented {
            fs::recreate_dir(&output_dir).await?;
        }

        let options = CaptureOptions {
            session_id: id.clone(),
            video_bitrate: self.config.video_bitrate,
        };
        let open = tokio::time::timeout(
            self.config.ready_timeout,
            self.capture.open(source_url, &options),
        );
        let capture = tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Shutdown),
            opened = open => opened
                .map_err(|_| Error::readiness_timeout(ReadinessStage::VideoSignal))
                .and_then(|r| r),
        };
        let capture = match capture {
            Ok(capture) => capture,
            Err(e) => {
                self.discard_output(mode, &output_dir).await;
                return Err(e);
            }
        };

        let job = TranscodeJob {
            session_id: id.clone(),
            mode,
            output_dir: output_dir.clone(),
            playlist_name: self.config.playlist_name.clone(),
            segment_base_url: format!("{}/hls/{}/", self.public_base_url, id),
        };
        let transcoder = match self.launcher.launch(&job) {
            Ok(transcoder) => transcoder,
            Err(e) => {
                capture.close();
                self.discard_output(mode, &output_dir).await;
                return Err(e);
            }
        };

        let session = StreamSession::start(
            id.clone(),
            source_url.to_string(),
            mode,
            output_dir,
            capture,
            transcoder,
            &self.config,
        );

        let ready = match self.await_ready(&session).await {
            Ok(()) => session.mark_ready(),
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            session.drain(CloseReason::InitializationFailed);
            session.closed().await;
            return Err(match e {
                Error::InvalidStateTransition { .. } => session
                    .close_reason()
                    .map(CloseReason::to_error)
                    .unwrap_or(e),
                e => e,
            });
        }

        Ok(session)
    }

    async fn await_ready(&self, session: &StreamSession) -> Result<()> {
        let timeout = self.config.ready_timeout;
        let stages = async {
            session.capture().wait_video_ready(timeout).await?;
            session.capture().wait_capture_active(timeout).await?;
            if session.mode() == OutputMode::Segmented {
                readiness::wait_for_segments(
                    session.output_dir(),
                    &self.config.playlist_name,
                    self.config.min_segments,
                    self.config.readiness_poll_interval,
                    timeout,
                )
                .await?;
            }
            Ok(())
        };

        tokio::select! {
            biased;
            _ = session.closed() => Err(session
                .close_reason()
                .map(CloseReason::to_error)
                .unwrap_or(Error::CaptureSourceLost)),
            _ = self.shutdown.cancelled() => Err(Error::Shutdown),
            result = stages => result,
        }
    }

    async fn discard_output(&self, mode: OutputMode, output_dir: &std::path::Path) {
        if mode == OutputMode::Segmented
            && let Err(e) = fs::remove_dir_all_if_exists(output_dir).await
        {
            warn!(error = %e, "Failed to remove output directory");
        }
    }

    /// Remove the entry once the session closes, whatever closed it.
    fn spawn_reaper(self: &Arc<Self>, session: Arc<StreamSession>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            session.closed().await;
            registry.entries.remove_if(session.id(), |_, entry| {
                matches!(entry, Entry::Live(live) if Arc::ptr_eq(live, &session))
            });
            debug!(session_id = %session.id(), "Removed session entry");
        });
    }

    /// Live session for `id`, if any.
    pub fn get(&self, id: &SessionId) -> Option<Arc<StreamSession>> {
        self.entries.get(id).and_then(|entry| match entry.value() {
            Entry::Live(session) if !session.is_closed() => Some(Arc::clone(session)),
            _ => None,
        })
    }

    /// Drain every segmented session nobody visited within the idle threshold.
    pub fn sweep_idle(&self) -> usize {
        let idle: Vec<Arc<StreamSession>> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.value() {
                Entry::Live(session)
                    if session.mode() == OutputMode::Segmented
                        && session.idle_for() > self.config.idle_timeout =>
                {
                    Some(Arc::clone(session))
                }
                _ => None,
            })
            .collect();

        let mut drained = 0;
        for session in idle {
            if session.drain(CloseReason::Idle) {
                info!(session_id = %session.id(), idle = ?session.idle_for(), "Evicting idle session");
                drained += 1;
            }
        }
        drained
    }

    /// Run [`Self::sweep_idle`] every sweep interval until `cancel` fires.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let evicted = registry.sweep_idle();
                        if evicted > 0 {
                            debug!(evicted, "Idle sweep finished");
                        }
                    }
                }
            }
            debug!("Idle sweeper stopped");
        })
    }

    /// Sessions currently registered, live or initializing.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.value() {
                Entry::Live(session) => Some(session.info()),
                Entry::Reserved(_) => None,
            })
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn live_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.value(), Entry::Live(s) if !s.is_closed()))
            .count()
    }

    pub fn reserved_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.value(), Entry::Reserved(_)))
            .count()
    }

    /// Fail pending creations, drain every session and wait for them to close.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();

        let sessions: Vec<Arc<StreamSession>> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.value() {
                Entry::Live(session) => Some(Arc::clone(session)),
                Entry::Reserved(_) => None,
            })
            .collect();

        for session in &sessions {
            session.drain(CloseReason::Shutdown);
        }

        let closing = futures::future::join_all(sessions.iter().map(|s| s.closed()));
        if tokio::time::timeout(self.config.ready_timeout, closing)
            .await
            .is_err()
        {
            warn!("Timed out waiting for sessions to close");
        }

        info!("Closed {} sessions", sessions.len());
        sessions.len()
    }

    /// Directory a session's segmented output lives in.
    pub fn output_dir(&self, id: &SessionId) -> PathBuf {
        self.config.output_root.join(id.as_str())
    }
}

/// Drains a continuous session whose requester stopped waiting for it.
///
/// Covers the requester going away after the outcome was published but before
/// it picked the session up.
struct AbandonedCreation {
    creation: Option<watch::Receiver<Creation>>,
}

impl AbandonedCreation {
    fn new(creation: &watch::Receiver<Creation>, mode: OutputMode) -> Self {
        Self {
            creation: (mode == OutputMode::Continuous).then(|| creation.clone()),
        }
    }

    fn disarm(mut self) {
        self.creation = None;
    }
}

impl Drop for AbandonedCreation {
    fn drop(&mut self) {
        let Some(creation) = self.creation.take() else {
            return;
        };
        if let Creation::Ready(session) = &*creation.borrow() {
            session.drain(CloseReason::ClientDisconnected);
        }
    }
}

async fn wait_for_creation(mut creation: watch::Receiver<Creation>) -> Result<Arc<StreamSession>> {
    let outcome = creation
        .wait_for(|c| !matches!(c, Creation::Pending))
        .await
        .map(|c| c.clone());
    match outcome {
        Ok(Creation::Ready(session)) => {
            session.touch();
            Ok(session)
        }
        Ok(Creation::Failed(e)) => Err(e),
        // The creating task went away without an outcome.
        Ok(Creation::Pending) | Err(_) => Err(Error::CaptureSourceLost),
    }
}
