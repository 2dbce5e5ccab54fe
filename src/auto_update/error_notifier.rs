// Error Notifier
// Classifies update errors and turns them into UI prompts, at most one per
// error kind inside the cooldown window

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::auto_update::config::UpdateConfig;
use crate::auto_update::events::{ErrorPrompt, Presentation, RecoveryAction, UiBus, UiEvent};
use crate::auto_update::logger::UpdateJournal;
use crate::auto_update::metrics::MetricsCollector;
use crate::auto_update::types::{
    is_cancellation_message, is_download_message, now_millis, ErrorKind, ErrorRecord, UpdateError,
};

/// Why a report did not reach the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// "No newer version" is not an error
    Terminal,
    /// The user paused or cancelled
    Cancellation,
    /// Development builds never prompt
    NonProduction,
    /// Same kind was prompted less than a cooldown ago
    Cooldown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NotifyOutcome {
    Suppressed(SuppressReason),
    Escalated(ErrorPrompt),
}

impl NotifyOutcome {
    pub fn is_escalated(&self) -> bool {
        matches!(self, NotifyOutcome::Escalated(_))
    }
}

#[derive(Debug, Default)]
struct NotifierState {
    last_error: Option<ErrorRecord>,
    last_notified: HashMap<ErrorKind, Instant>,
}

pub struct ErrorNotifier {
    production: bool,
    cooldown: Duration,
    releases_url: String,
    bus: UiBus,
    metrics: Arc<MetricsCollector>,
    journal: UpdateJournal,
    state: Mutex<NotifierState>,
}

impl ErrorNotifier {
    pub fn new(
        config: &UpdateConfig,
        bus: UiBus,
        metrics: Arc<MetricsCollector>,
        journal: UpdateJournal,
    ) -> Self {
        Self {
            production: config.production,
            cooldown: config.error_cooldown(),
            releases_url: config.releases_url.clone(),
            bus,
            metrics,
            journal,
            state: Mutex::new(NotifierState::default()),
        }
    }

    /// Download errors are anything raised mid-transfer or mentioning the artifact
    pub fn classify(error: &UpdateError, in_download: bool) -> ErrorKind {
        if in_download
            || matches!(error, UpdateError::DownloadFailure(_))
            || is_download_message(&error.message())
        {
            ErrorKind::Download
        } else {
            ErrorKind::Check
        }
    }

    pub fn report(&self, error: &UpdateError, in_download: bool) -> NotifyOutcome {
        let message = error.message();
        let kind = Self::classify(error, in_download);

        // Message text only hints at a user cancellation for transfers
        let cancelled = matches!(error, UpdateError::UserCancellation)
            || (kind == ErrorKind::Download && is_cancellation_message(&message));
        if cancelled {
            log::debug!("[ErrorNotifier] Ignoring cancellation: {}", message);
            return NotifyOutcome::Suppressed(SuppressReason::Cancellation);
        }

        if error.is_terminal() {
            log::info!("[ErrorNotifier] No update available: {}", message);
            return NotifyOutcome::Suppressed(SuppressReason::Terminal);
        }

        self.metrics.record_error();
        self.journal.error(
            &kind.to_string(),
            &error.to_string(),
            serde_json::json!({ "kind": kind, "error": error }),
        );

        let now = Instant::now();
        let mut state = self.state.lock();
        state.last_error = Some(ErrorRecord {
            message: message.clone(),
            timestamp: now_millis(),
            kind,
        });

        if !self.production {
            log::warn!("[ErrorNotifier] {} error (not shown outside production): {}", kind, error);
            return NotifyOutcome::Suppressed(SuppressReason::NonProduction);
        }

        if let Some(last) = state.last_notified.get(&kind) {
            if now.duration_since(*last) < self.cooldown {
                log::warn!("[ErrorNotifier] {} error within cooldown, not shown: {}", kind, error);
                return NotifyOutcome::Suppressed(SuppressReason::Cooldown);
            }
        }
        state.last_notified.insert(kind, now);
        drop(state);

        let presentation = if kind == ErrorKind::Check && error.is_network() {
            Presentation::Notification
        } else {
            Presentation::Dialog {
                actions: match kind {
                    ErrorKind::Check => {
                        vec![RecoveryAction::OpenReleasesPage, RecoveryAction::TryAgain]
                    }
                    ErrorKind::Download => {
                        vec![RecoveryAction::DownloadManually, RecoveryAction::TryAgain]
                    }
                },
            }
        };

        let prompt = ErrorPrompt {
            kind,
            message,
            presentation,
            releases_url: self.releases_url.clone(),
        };

        log::error!("[ErrorNotifier] Surfacing {} error: {}", kind, error);
        self.bus.publish(UiEvent::Error(prompt.clone()));
        NotifyOutcome::Escalated(prompt)
    }

    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.state.lock().last_error.clone()
    }

    pub fn clear_last_error(&self) {
        self.state.lock().last_error = None;
    }

    /// Forget cooldowns, e.g. after the user explicitly asked to retry
    pub fn reset_cooldowns(&self) {
        self.state.lock().last_notified.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier_with(production: bool) -> (ErrorNotifier, UiBus, Arc<MetricsCollector>) {
        let config = UpdateConfig {
            production,
            ..UpdateConfig::default()
        };
        let bus = UiBus::default();
        let metrics = Arc::new(MetricsCollector::new());
        let notifier =
            ErrorNotifier::new(&config, bus.clone(), metrics.clone(), UpdateJournal::disabled());
        (notifier, bus, metrics)
    }

    #[test]
    fn test_classification() {
        let plain = UpdateError::UnexpectedCheck("HTTP 500".to_string());
        assert_eq!(ErrorNotifier::classify(&plain, false), ErrorKind::Check);
        assert_eq!(ErrorNotifier::classify(&plain, true), ErrorKind::Download);

        let checksum = UpdateError::UnexpectedCheck("sha512 checksum mismatch".to_string());
        assert_eq!(ErrorNotifier::classify(&checksum, false), ErrorKind::Download);

        let failure = UpdateError::DownloadFailure("disk full".to_string());
        assert_eq!(ErrorNotifier::classify(&failure, false), ErrorKind::Download);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_is_per_kind() {
        let (notifier, bus, _) = notifier_with(true);
        let download = UpdateError::DownloadFailure("sha512 checksum mismatch".to_string());
        let check = UpdateError::UnexpectedCheck("HTTP 502 Bad Gateway".to_string());

        assert!(notifier.report(&download, true).is_escalated());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(notifier.report(&check, false).is_escalated());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            notifier.report(&download, true),
            NotifyOutcome::Suppressed(SuppressReason::Cooldown)
        );

        assert_eq!(bus.recent_on("update:error").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_expires() {
        let (notifier, bus, metrics) = notifier_with(true);
        let error = UpdateError::DownloadFailure("disk full".to_string());

        assert!(notifier.report(&error, true).is_escalated());
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!notifier.report(&error, true).is_escalated());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(notifier.report(&error, true).is_escalated());

        assert_eq!(bus.recent_on("update:error").len(), 2);
        assert_eq!(metrics.snapshot().error_count, 3);
    }

    #[test]
    fn test_terminal_and_cancellation_never_escalate() {
        let (notifier, bus, metrics) = notifier_with(true);

        let terminal = UpdateError::UnexpectedCheck("No published versions on GitHub".to_string());
        assert_eq!(
            notifier.report(&terminal, false),
            NotifyOutcome::Suppressed(SuppressReason::Terminal)
        );
        assert_eq!(
            notifier.report(&UpdateError::UserCancellation, true),
            NotifyOutcome::Suppressed(SuppressReason::Cancellation)
        );

        assert!(bus.recent().is_empty());
        assert!(notifier.last_error().is_none());
        assert_eq!(metrics.snapshot().error_count, 0);
    }

    #[test]
    fn test_check_errors_are_never_treated_as_cancellation() {
        let (notifier, bus, metrics) = notifier_with(true);

        let reset = UpdateError::UnexpectedCheck("read ECONNABORTED (after 3 attempts)".to_string());
        assert!(notifier.report(&reset, false).is_escalated());

        let wording = UpdateError::UnexpectedCheck("request cancelled by proxy".to_string());
        notifier.reset_cooldowns();
        assert!(notifier.report(&wording, false).is_escalated());

        assert_eq!(notifier.last_error().unwrap().kind, ErrorKind::Check);
        assert_eq!(metrics.snapshot().error_count, 2);
        assert_eq!(bus.recent_on("update:error").len(), 2);

        // During a transfer the same wording is a user cancellation
        let transfer = UpdateError::DownloadFailure("download cancelled".to_string());
        assert_eq!(
            notifier.report(&transfer, true),
            NotifyOutcome::Suppressed(SuppressReason::Cancellation)
        );
    }

    #[test]
    fn test_non_production_records_but_stays_silent() {
        let (notifier, bus, _) = notifier_with(false);
        let error = UpdateError::UnexpectedCheck("HTTP 500".to_string());

        assert_eq!(
            notifier.report(&error, false),
            NotifyOutcome::Suppressed(SuppressReason::NonProduction)
        );
        assert!(bus.recent().is_empty());
        assert_eq!(notifier.last_error().unwrap().message, "HTTP 500");
    }

    #[test]
    fn test_network_check_error_is_a_notification() {
        let (notifier, _, _) = notifier_with(true);
        let error = UpdateError::TransientNetwork("getaddrinfo ENOTFOUND updates".to_string());

        match notifier.report(&error, false) {
            NotifyOutcome::Escalated(prompt) => {
                assert_eq!(prompt.kind, ErrorKind::Check);
                assert_eq!(prompt.presentation, Presentation::Notification);
            }
            other => panic!("Expected escalation, got {:?}", other),
        }
    }

    #[test]
    fn test_recovery_actions_per_kind() {
        let (notifier, _, _) = notifier_with(true);

        match notifier.report(&UpdateError::UnexpectedCheck("HTTP 500".to_string()), false) {
            NotifyOutcome::Escalated(prompt) => assert_eq!(
                prompt.presentation,
                Presentation::Dialog {
                    actions: vec![RecoveryAction::OpenReleasesPage, RecoveryAction::TryAgain]
                }
            ),
            other => panic!("Expected escalation, got {:?}", other),
        }

        // A network failure during a transfer is still a download dialog
        match notifier.report(&UpdateError::TransientNetwork("ECONNREFUSED".to_string()), true) {
            NotifyOutcome::Escalated(prompt) => assert_eq!(
                prompt.presentation,
                Presentation::Dialog {
                    actions: vec![RecoveryAction::DownloadManually, RecoveryAction::TryAgain]
                }
            ),
            other => panic!("Expected escalation, got {:?}", other),
        }
    }

    #[test]
    fn test_last_error_and_reset() {
        let (notifier, _, _) = notifier_with(true);
        let error = UpdateError::UnexpectedCheck("HTTP 500".to_string());

        notifier.report(&error, false);
        let record = notifier.last_error().unwrap();
        assert_eq!(record.kind, ErrorKind::Check);

        notifier.clear_last_error();
        assert!(notifier.last_error().is_none());

        notifier.reset_cooldowns();
        assert!(notifier.report(&error, false).is_escalated());
    }
}
