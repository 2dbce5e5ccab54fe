// Auto-Update Coordination Module
// Schedules and deduplicates version checks, drives a resumable download
// session with crash recovery, and decides which errors reach the user.
// The delivery engine, UI layer, key/value store and focus signal are
// external collaborators reached through the traits in `engine` and `store`.

mod cancel;
mod check_coordinator;
mod config;
mod coordinator;
mod download_session;
mod engine;
mod error_notifier;
mod events;
mod logger;
mod metrics;
mod postpone;
mod release_notes;
mod store;
mod types;

// Re-export core types for external use
pub use types::{
    DownloadState, ErrorKind, ErrorRecord, UpdateError, UpdateInfo, UpdatePhase, UpdateResult,
};

// Re-export config functions
pub use config::{get_config_path, load_config, load_config_from, save_config, save_config_to, UpdateConfig};

// Re-export the collaborator ports
pub use cancel::CancellationToken;
pub use engine::{
    AlwaysFocused, DownloadRequest, EngineError, EngineEvent, FocusMonitor, UpdateDeliveryEngine,
};
pub use store::{JsonFileStore, MemoryStore, PersistenceAdapter};

// Re-export UI channels
pub use events::{
    AvailablePrompt, ErrorPrompt, Presentation, RecoveryAction, UiBus, UiEvent, Urgency,
};

// Re-export components
pub use check_coordinator::{CheckCoordinator, CheckOutcome};
pub use coordinator::UpdateCoordinator;
pub use download_session::{DownloadSessionManager, DOWNLOAD_STATE_KEY};
pub use error_notifier::{ErrorNotifier, NotifyOutcome, SuppressReason};
pub use logger::{LogLevel, UpdateJournal, UpdateLogEntry, UpdateLogger};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use postpone::PostponeScheduler;
pub use release_notes::ReleaseNotesCache;
