// Update Coordinator - operational surface of the update engine
// Wires the check, download, postpone and notification components together,
// pumps engine events and runs the background check schedule

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::auto_update::check_coordinator::CheckCoordinator;
use crate::auto_update::config::UpdateConfig;
use crate::auto_update::download_session::DownloadSessionManager;
use crate::auto_update::engine::{EngineEvent, FocusMonitor, UpdateDeliveryEngine};
use crate::auto_update::error_notifier::ErrorNotifier;
use crate::auto_update::events::{AvailablePrompt, UiBus, UiEvent};
use crate::auto_update::logger::UpdateJournal;
use crate::auto_update::metrics::{MetricsCollector, MetricsSnapshot};
use crate::auto_update::postpone::PostponeScheduler;
use crate::auto_update::release_notes::ReleaseNotesCache;
use crate::auto_update::store::PersistenceAdapter;
use crate::auto_update::types::{DownloadState, ErrorRecord, UpdateError, UpdateInfo, UpdatePhase};

/// Update coordinator - owns every update component, built once per process
pub struct UpdateCoordinator {
    config: UpdateConfig,
    engine: Arc<dyn UpdateDeliveryEngine>,
    focus: Arc<dyn FocusMonitor>,
    bus: UiBus,
    metrics: Arc<MetricsCollector>,
    notes: Arc<ReleaseNotesCache>,
    notifier: Arc<ErrorNotifier>,
    postpone: PostponeScheduler,
    checks: CheckCoordinator,
    downloads: DownloadSessionManager,
    journal: UpdateJournal,
    /// Latest version reported as available and not yet installed
    available: Mutex<Option<UpdateInfo>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UpdateCoordinator {
    /// Create the coordinator. Recovers persisted download progress, so a
    /// download interrupted by a restart can be resumed right away.
    pub fn new(
        config: UpdateConfig,
        engine: Arc<dyn UpdateDeliveryEngine>,
        store: Arc<dyn PersistenceAdapter>,
        focus: Arc<dyn FocusMonitor>,
        journal: UpdateJournal,
    ) -> Result<Arc<Self>, UpdateError> {
        config.validate()?;

        let bus = UiBus::default();
        let metrics = Arc::new(MetricsCollector::new());
        let notes = Arc::new(ReleaseNotesCache::new(
            config.release_notes_budget,
            config.release_notes_capacity,
        ));
        let notifier = Arc::new(ErrorNotifier::new(
            &config,
            bus.clone(),
            metrics.clone(),
            journal.clone(),
        ));
        let postpone = PostponeScheduler::new(&config, bus.clone(), notes.clone());
        let checks =
            CheckCoordinator::new(&config, engine.clone(), metrics.clone(), journal.clone());
        let downloads = DownloadSessionManager::new(
            engine.clone(),
            store,
            notifier.clone(),
            metrics.clone(),
            bus.clone(),
            journal.clone(),
            config.max_download_age_ms,
        );

        log::info!(
            "[UpdateCoordinator] Initialized (production: {}, interval: {:?})",
            config.production,
            config.check_interval()
        );

        Ok(Arc::new(Self {
            config,
            engine,
            focus,
            bus,
            metrics,
            notes,
            notifier,
            postpone,
            checks,
            downloads,
            journal,
            available: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    pub fn bus(&self) -> &UiBus {
        &self.bus
    }

    /// Receiver for every `update:*` UI event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.bus.subscribe()
    }

    /// Spawn the engine event pump, the startup check and the periodic check.
    /// Calling it again restarts the background tasks.
    pub fn start(self: &Arc<Self>) {
        self.shutdown_tasks();

        let events = self.engine.subscribe();
        let weak = Arc::downgrade(self);
        let pump = tokio::spawn(run_event_pump(weak.clone(), events));

        let startup_delay = self.config.startup_check_delay();
        let startup_weak = weak.clone();
        let startup = tokio::spawn(async move {
            tokio::time::sleep(startup_delay).await;
            if let Some(this) = startup_weak.upgrade() {
                this.scheduled_check("startup").await;
            }
        });

        let interval = self.config.check_interval();
        let periodic = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(this) => this.scheduled_check("periodic").await,
                    None => break,
                }
            }
        });

        self.tasks.lock().extend([pump, startup, periodic]);
        log::info!(
            "[UpdateCoordinator] Background tasks started (startup check in {:?}, then every {:?})",
            startup_delay,
            interval
        );
    }

    /// Stop background tasks and the postpone reminder
    pub fn shutdown(&self) {
        self.shutdown_tasks();
        self.postpone.shutdown();
        log::info!("[UpdateCoordinator] Shut down");
    }

    fn shutdown_tasks(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    async fn scheduled_check(&self, trigger: &str) {
        let idle = self.focus.idle_duration();
        if idle >= self.config.idle_threshold() {
            log::info!(
                "[UpdateCoordinator] Skipping {} check, no window focused for {:?}",
                trigger,
                idle
            );
            return;
        }

        log::info!("[UpdateCoordinator] Running {} check", trigger);
        if let Err(e) = self.check_now().await {
            log::warn!("[UpdateCoordinator] {} check failed: {}", trigger, e);
        }
    }

    /// Check for a newer version now (debounced and cached)
    pub async fn check_now(&self) -> Result<Option<UpdateInfo>, UpdateError> {
        match self.checks.request_check().await {
            Ok(Some(result)) => {
                self.surface_available(result.info.clone());
                Ok(Some(result.info))
            }
            Ok(None) => Ok(None),
            Err(error) => {
                self.notifier.report(&error, self.downloads.is_downloading());
                Err(error)
            }
        }
    }

    fn surface_available(&self, info: UpdateInfo) {
        self.postpone.on_new_version_observed(&info);
        *self.available.lock() = Some(info.clone());

        let postponed = self.postpone.pending_version().as_deref() == Some(info.version.as_str());
        if postponed && self.postpone.has_reminder() {
            log::debug!(
                "[UpdateCoordinator] {} postponed, waiting for the reminder",
                info.version
            );
            return;
        }

        let already_fetched = self
            .downloads
            .completed()
            .is_some_and(|done| done.version == info.version);
        if already_fetched || self.downloads.is_downloading() {
            log::debug!(
                "[UpdateCoordinator] {} already being handled, not prompting",
                info.version
            );
            return;
        }

        let prompt = AvailablePrompt {
            release_notes: self.notes.format(&info),
            urgency: self.postpone.urgency(),
            postpone_count: self.postpone.postpone_count(),
            info,
        };
        log::info!(
            "[UpdateCoordinator] Update {} available ({:?})",
            prompt.info.version,
            prompt.urgency
        );
        self.bus.publish(UiEvent::Available(prompt));
    }

    /// Download the available update and wait until the transfer ends.
    /// A pause or cancel during the transfer is not an error.
    pub async fn download_update(&self) -> Result<(), UpdateError> {
        let info = self
            .available
            .lock()
            .clone()
            .or_else(|| self.checks.cached_result().map(|result| result.info))
            .ok_or_else(|| UpdateError::InvalidState {
                current: "no update available".to_string(),
                attempted: "download update".to_string(),
            })?;

        let result = self.downloads.start(&info.version, &info.download_url).await;
        self.after_transfer(result)
    }

    pub fn pause_download(&self) -> Result<DownloadState, UpdateError> {
        self.downloads.pause()
    }

    pub async fn resume_download(&self) -> Result<(), UpdateError> {
        let result = self.downloads.resume().await;
        self.after_transfer(result)
    }

    pub fn cancel_download(&self) -> Result<(), UpdateError> {
        self.downloads.cancel()
    }

    fn after_transfer(&self, result: Result<(), UpdateError>) -> Result<(), UpdateError> {
        match result {
            Ok(()) => {
                if self.downloads.completed().is_some() {
                    self.postpone.on_downloaded();
                }
                Ok(())
            }
            Err(UpdateError::UserCancellation) => Ok(()),
            Err(error) => Err(error),
        }
    }

    /// Remind me later. Returns how often this version was postponed.
    pub fn postpone_update(&self, info: &UpdateInfo) -> u32 {
        self.journal
            .info("postpone", &format!("Update {} postponed", info.version));
        self.postpone.postpone(info)
    }

    pub fn get_last_error(&self) -> Option<ErrorRecord> {
        self.notifier.last_error()
    }

    pub fn clear_last_error(&self) {
        self.notifier.clear_last_error();
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn get_download_progress(&self) -> Option<DownloadState> {
        self.downloads.progress()
    }

    pub fn is_update_downloaded(&self) -> bool {
        self.downloads.completed().is_some()
    }

    /// Ask the UI to get ready, then hand over to the installer
    pub fn quit_and_install(&self) -> Result<(), UpdateError> {
        let info = self
            .downloads
            .completed()
            .ok_or_else(|| UpdateError::InvalidState {
                current: self.downloads.phase_name().to_string(),
                attempted: "install update".to_string(),
            })?;

        log::info!("[UpdateCoordinator] Installing {}", info.version);
        self.journal
            .info("install", &format!("Quitting to install {}", info.version));
        self.bus.publish(UiEvent::InstallRequest(info));
        self.engine.quit_and_install();
        Ok(())
    }

    pub fn phase(&self) -> UpdatePhase {
        if let Some(info) = self.downloads.completed() {
            return UpdatePhase::Downloaded(info);
        }
        if self.downloads.is_downloading() || self.downloads.is_paused() {
            if let Some(progress) = self.downloads.progress() {
                return UpdatePhase::Downloading(progress);
            }
        }
        match self.available.lock().clone() {
            Some(info) => UpdatePhase::Available(info),
            None => UpdatePhase::NoUpdate,
        }
    }

    fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Available(info) => {
                self.checks.observe_version(&info.version);
                let known = self
                    .available
                    .lock()
                    .as_ref()
                    .is_some_and(|current| current.version == info.version);
                if !known {
                    self.surface_available(info);
                }
            }
            EngineEvent::NotAvailable => {
                log::debug!("[UpdateCoordinator] Engine reports no update");
            }
            EngineEvent::Progress {
                transferred, total, ..
            } => self.downloads.on_progress(transferred, total),
            EngineEvent::Downloaded(info) => {
                self.downloads.on_downloaded(&info);
                self.postpone.on_downloaded();
            }
            EngineEvent::Error(error) => {
                // Errors of an awaited check or transfer are reported by its caller
                if self.checks.is_checking() || self.downloads.is_downloading() {
                    log::debug!("[UpdateCoordinator] Engine error during operation: {}", error);
                    return;
                }
                let update_error = if error.is_network() {
                    UpdateError::TransientNetwork(error.to_string())
                } else {
                    UpdateError::UnexpectedCheck(error.to_string())
                };
                self.notifier.report(&update_error, false);
            }
        }
    }
}

async fn run_event_pump(
    coordinator: Weak<UpdateCoordinator>,
    mut events: broadcast::Receiver<EngineEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => match coordinator.upgrade() {
                Some(this) => this.handle_engine_event(event),
                None => break,
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("[UpdateCoordinator] Missed {} engine events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => {
                log::info!("[UpdateCoordinator] Engine event stream closed");
                break;
            }
        }
    }
}

impl Drop for UpdateCoordinator {
    fn drop(&mut self) {
        self.shutdown_tasks();
        self.postpone.shutdown();
    }
}
