// Download Session Manager
// Owns the download lifecycle (start / pause / resume / cancel) and keeps the
// partial progress persisted so a crash or restart can resume.
//
//   Idle -> Downloading -> {Completed, Paused, Cancelled, Failed}
//   Paused -> Downloading (resume) | Cancelled

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;

use crate::auto_update::cancel::CancellationToken;
use crate::auto_update::engine::{DownloadRequest, EngineError, UpdateDeliveryEngine};
use crate::auto_update::error_notifier::ErrorNotifier;
use crate::auto_update::events::{UiBus, UiEvent};
use crate::auto_update::logger::UpdateJournal;
use crate::auto_update::metrics::MetricsCollector;
use crate::auto_update::store::PersistenceAdapter;
use crate::auto_update::types::{now_millis, DownloadState, UpdateError, UpdateInfo};

/// Store key holding the persisted `DownloadState`
pub const DOWNLOAD_STATE_KEY: &str = "update.download-state";

#[derive(Debug, Clone)]
enum SessionPhase {
    Idle,
    Downloading {
        token: CancellationToken,
        started_at: Instant,
    },
    Paused {
        snapshot: DownloadState,
    },
    Completed(UpdateInfo),
    Cancelled,
    Failed {
        message: String,
    },
}

impl SessionPhase {
    fn name(&self) -> &'static str {
        match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Downloading { .. } => "downloading",
            SessionPhase::Paused { .. } => "paused",
            SessionPhase::Completed(_) => "completed",
            SessionPhase::Cancelled => "cancelled",
            SessionPhase::Failed { .. } => "failed",
        }
    }
}

struct Session {
    phase: SessionPhase,
    progress: Option<DownloadState>,
}

pub struct DownloadSessionManager {
    engine: Arc<dyn UpdateDeliveryEngine>,
    store: Arc<dyn PersistenceAdapter>,
    notifier: Arc<ErrorNotifier>,
    metrics: Arc<MetricsCollector>,
    bus: UiBus,
    journal: UpdateJournal,
    session: Mutex<Session>,
}

impl DownloadSessionManager {
    /// Creates the manager and recovers any persisted progress younger than
    /// `max_age_ms`; recovered progress starts out paused.
    pub fn new(
        engine: Arc<dyn UpdateDeliveryEngine>,
        store: Arc<dyn PersistenceAdapter>,
        notifier: Arc<ErrorNotifier>,
        metrics: Arc<MetricsCollector>,
        bus: UiBus,
        journal: UpdateJournal,
        max_age_ms: u64,
    ) -> Self {
        let recovered = Self::load_persisted(store.as_ref(), max_age_ms);
        let session = match recovered {
            Some(snapshot) => Session {
                phase: SessionPhase::Paused {
                    snapshot: snapshot.clone(),
                },
                progress: Some(snapshot),
            },
            None => Session {
                phase: SessionPhase::Idle,
                progress: None,
            },
        };

        Self {
            engine,
            store,
            notifier,
            metrics,
            bus,
            journal,
            session: Mutex::new(session),
        }
    }

    fn load_persisted(store: &dyn PersistenceAdapter, max_age_ms: u64) -> Option<DownloadState> {
        let value = match store.get(DOWNLOAD_STATE_KEY) {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("[DownloadSession] Failed to read persisted progress: {}", e);
                return None;
            }
        };

        let discard = |reason: &str| {
            log::info!("[DownloadSession] Discarding persisted progress: {}", reason);
            if let Err(e) = store.delete(DOWNLOAD_STATE_KEY) {
                log::warn!("[DownloadSession] Failed to delete persisted progress: {}", e);
            }
        };

        match serde_json::from_value::<DownloadState>(value) {
            Ok(state) if state.is_expired(now_millis(), max_age_ms) => {
                discard("older than the maximum age");
                None
            }
            Ok(state) => {
                log::info!(
                    "[DownloadSession] Recovered progress for {}: {} / {} bytes",
                    state.version,
                    state.downloaded_bytes,
                    state.total_bytes
                );
                Some(state)
            }
            Err(e) => {
                discard(&e.to_string());
                None
            }
        }
    }

    fn persist(&self, state: &DownloadState) {
        let value = match serde_json::to_value(state) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("[DownloadSession] Failed to serialize progress: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.set(DOWNLOAD_STATE_KEY, value) {
            log::warn!("[DownloadSession] Failed to persist progress: {}", e);
        }
    }

    fn clear_persisted(&self) {
        if let Err(e) = self.store.delete(DOWNLOAD_STATE_KEY) {
            log::warn!("[DownloadSession] Failed to clear persisted progress: {}", e);
        }
    }

    /// Download `version` from `url` and wait for the transfer to end.
    ///
    /// Returns `Err(UserCancellation)` when the transfer ended because of a
    /// pause or cancel request.
    pub async fn start(&self, version: &str, url: &str) -> Result<(), UpdateError> {
        let (token, state) = {
            let mut session = self.session.lock();
            if let SessionPhase::Downloading { .. } = session.phase {
                return Err(UpdateError::InvalidState {
                    current: "downloading".to_string(),
                    attempted: "start download".to_string(),
                });
            }

            let state = match session.progress.take() {
                Some(mut existing) if existing.version == version => {
                    if !url.is_empty() {
                        existing.url = url.to_string();
                    }
                    existing
                }
                _ => DownloadState::new(version, url),
            };

            let token = CancellationToken::new();
            session.progress = Some(state.clone());
            session.phase = SessionPhase::Downloading {
                token: token.clone(),
                started_at: Instant::now(),
            };
            (token, state)
        };

        self.persist(&state);
        self.journal.reset_progress();
        self.journal.info(
            "download",
            &format!(
                "Starting download of {} at {} / {} bytes",
                state.version, state.downloaded_bytes, state.total_bytes
            ),
        );
        log::info!("[DownloadSession] Starting download of {}", state.version);

        let request = DownloadRequest {
            version: state.version.clone(),
            url: state.url.clone(),
        };

        match self.engine.download_update(request, token.clone()).await {
            Ok(()) => {
                let fallback = UpdateInfo {
                    download_url: state.url.clone(),
                    ..UpdateInfo::new(&state.version)
                };
                self.complete_if_current(&token, fallback);
                Ok(())
            }
            Err(error) => self.handle_engine_error(&token, error),
        }
    }

    fn handle_engine_error(
        &self,
        token: &CancellationToken,
        error: EngineError,
    ) -> Result<(), UpdateError> {
        if token.is_cancelled() {
            log::info!("[DownloadSession] Transfer stopped on request: {}", error);
            return Err(UpdateError::UserCancellation);
        }

        {
            let mut session = self.session.lock();
            match &session.phase {
                SessionPhase::Downloading { token: current, .. } if current.same_as(token) => {
                    session.phase = SessionPhase::Failed {
                        message: error.message.clone(),
                    };
                }
                // A pause or cancel already moved the session on
                _ => return Err(UpdateError::UserCancellation),
            }
        }

        let update_error = if error.is_network() {
            UpdateError::TransientNetwork(error.to_string())
        } else {
            UpdateError::DownloadFailure(error.to_string())
        };
        log::error!("[DownloadSession] Download failed: {}", update_error);
        self.notifier.report(&update_error, true);
        Err(update_error)
    }

    fn complete_if_current(&self, token: &CancellationToken, info: UpdateInfo) {
        let started_at = {
            let session = self.session.lock();
            match &session.phase {
                SessionPhase::Downloading {
                    token: current,
                    started_at,
                } if current.same_as(token) => *started_at,
                _ => return,
            }
        };
        self.complete(started_at, info);
    }

    /// `downloaded` event from the engine
    pub fn on_downloaded(&self, info: &UpdateInfo) {
        let started_at = {
            let mut session = self.session.lock();
            match &session.phase {
                SessionPhase::Downloading { started_at, .. } => *started_at,
                SessionPhase::Completed(existing) if existing.version == info.version => {
                    // Richer descriptor than the one built when the transfer returned
                    session.phase = SessionPhase::Completed(info.clone());
                    return;
                }
                other => {
                    log::debug!(
                        "[DownloadSession] Ignoring downloaded event while {}",
                        other.name()
                    );
                    return;
                }
            }
        };
        self.complete(started_at, info.clone());
    }

    fn complete(&self, started_at: Instant, info: UpdateInfo) {
        {
            let mut session = self.session.lock();
            session.phase = SessionPhase::Completed(info.clone());
            session.progress = None;
        }

        let duration_ms = started_at.elapsed().as_millis() as u64;
        self.metrics.record_download(duration_ms);
        self.clear_persisted();

        log::info!(
            "[DownloadSession] Download of {} completed in {}ms",
            info.version,
            duration_ms
        );
        self.journal.info(
            "download",
            &format!("Downloaded {} in {}ms", info.version, duration_ms),
        );
        self.bus.publish(UiEvent::Downloaded(info));
    }

    /// `progress` event from the engine; persisted immediately
    pub fn on_progress(&self, transferred: u64, total: u64) {
        let state = {
            let mut session = self.session.lock();
            if !matches!(session.phase, SessionPhase::Downloading { .. }) {
                return;
            }
            match session.progress.as_mut() {
                Some(state) => {
                    state.apply_progress(transferred, total);
                    state.clone()
                }
                None => return,
            }
        };

        self.persist(&state);
        self.journal.progress(&state);
        self.bus.publish(UiEvent::DownloadProgress(state));
    }

    /// Stop the transfer but keep its progress for `resume`
    pub fn pause(&self) -> Result<DownloadState, UpdateError> {
        let snapshot = {
            let mut session = self.session.lock();
            let token = match &session.phase {
                SessionPhase::Downloading { token, .. } => token.clone(),
                other => {
                    return Err(UpdateError::InvalidState {
                        current: other.name().to_string(),
                        attempted: "pause download".to_string(),
                    })
                }
            };
            token.cancel();

            let snapshot = match session.progress.clone() {
                Some(state) => state,
                None => return Err(UpdateError::InvalidState {
                    current: "downloading without progress".to_string(),
                    attempted: "pause download".to_string(),
                }),
            };
            session.phase = SessionPhase::Paused {
                snapshot: snapshot.clone(),
            };
            snapshot
        };

        self.persist(&snapshot);
        log::info!(
            "[DownloadSession] Paused {} at {} / {} bytes",
            snapshot.version,
            snapshot.downloaded_bytes,
            snapshot.total_bytes
        );
        self.bus.publish(UiEvent::DownloadPaused(snapshot.clone()));
        Ok(snapshot)
    }

    /// Continue a paused (or recovered) download with the same version
    pub async fn resume(&self) -> Result<(), UpdateError> {
        let snapshot = {
            let mut session = self.session.lock();
            let snapshot = match &session.phase {
                SessionPhase::Paused { snapshot } => snapshot.clone(),
                other => {
                    return Err(UpdateError::InvalidState {
                        current: other.name().to_string(),
                        attempted: "resume download".to_string(),
                    })
                }
            };
            session.progress = Some(snapshot.clone());
            session.phase = SessionPhase::Idle;
            snapshot
        };

        log::info!("[DownloadSession] Resuming {}", snapshot.version);
        self.bus.publish(UiEvent::DownloadResumed(snapshot.clone()));
        self.start(&snapshot.version, &snapshot.url).await
    }

    /// Stop the transfer and forget its progress; no resume afterwards
    pub fn cancel(&self) -> Result<(), UpdateError> {
        let version = {
            let mut session = self.session.lock();
            match &session.phase {
                SessionPhase::Downloading { token, .. } => token.cancel(),
                SessionPhase::Paused { .. } => {}
                other => {
                    return Err(UpdateError::InvalidState {
                        current: other.name().to_string(),
                        attempted: "cancel download".to_string(),
                    })
                }
            }
            session.phase = SessionPhase::Cancelled;
            session
                .progress
                .take()
                .map(|state| state.version)
                .unwrap_or_default()
        };

        self.clear_persisted();
        log::info!("[DownloadSession] Cancelled download of {}", version);
        self.journal
            .info("download", &format!("Download of {} cancelled", version));
        self.bus.publish(UiEvent::DownloadCancelled { version });
        Ok(())
    }

    /// Current (or paused / recovered) progress; `None` after cancel or success
    pub fn progress(&self) -> Option<DownloadState> {
        self.session.lock().progress.clone()
    }

    pub fn is_downloading(&self) -> bool {
        matches!(self.session.lock().phase, SessionPhase::Downloading { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.session.lock().phase, SessionPhase::Paused { .. })
    }

    /// Descriptor of the finished download, if any
    pub fn completed(&self) -> Option<UpdateInfo> {
        match &self.session.lock().phase {
            SessionPhase::Completed(info) => Some(info.clone()),
            _ => None,
        }
    }

    pub fn last_failure(&self) -> Option<String> {
        match &self.session.lock().phase {
            SessionPhase::Failed { message } => Some(message.clone()),
            _ => None,
        }
    }

    pub fn phase_name(&self) -> &'static str {
        self.session.lock().phase.name()
    }
}
