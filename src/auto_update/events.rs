// UI broadcast channels
// Fire-and-forget events for the UI layer; nobody acknowledges them

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::auto_update::types::{DownloadState, ErrorKind, UpdateInfo};

/// Number of recent events retained for late subscribers and diagnostics
const BACKLOG_CAPACITY: usize = 32;

/// How insistent an "update available" prompt should be
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Normal,
    /// Shown once the user has postponed the maximum number of times
    Escalated,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AvailablePrompt {
    pub info: UpdateInfo,
    /// Sanitized, length-bounded notes ready for display
    pub release_notes: String,
    pub urgency: Urgency,
    pub postpone_count: u32,
}

/// Manual recovery offered next to an error
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    OpenReleasesPage,
    DownloadManually,
    TryAgain,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "style", rename_all = "lowercase")]
pub enum Presentation {
    /// Blocking dialog with recovery buttons
    Dialog { actions: Vec<RecoveryAction> },
    /// Persistent low-urgency notification
    Notification,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPrompt {
    pub kind: ErrorKind,
    pub message: String,
    pub presentation: Presentation,
    pub releases_url: String,
}

/// Event published on one of the `update:*` channels
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "channel", content = "payload")]
pub enum UiEvent {
    #[serde(rename = "update:available")]
    Available(AvailablePrompt),

    #[serde(rename = "update:download-progress")]
    DownloadProgress(DownloadState),

    #[serde(rename = "update:downloaded")]
    Downloaded(UpdateInfo),

    #[serde(rename = "update:download-cancelled")]
    DownloadCancelled { version: String },

    #[serde(rename = "update:download-paused")]
    DownloadPaused(DownloadState),

    #[serde(rename = "update:download-resumed")]
    DownloadResumed(DownloadState),

    #[serde(rename = "update:error")]
    Error(ErrorPrompt),

    #[serde(rename = "update:install-request")]
    InstallRequest(UpdateInfo),
}

impl UiEvent {
    /// Channel name the UI layer listens on
    pub fn channel(&self) -> &'static str {
        match self {
            UiEvent::Available(_) => "update:available",
            UiEvent::DownloadProgress(_) => "update:download-progress",
            UiEvent::Downloaded(_) => "update:downloaded",
            UiEvent::DownloadCancelled { .. } => "update:download-cancelled",
            UiEvent::DownloadPaused(_) => "update:download-paused",
            UiEvent::DownloadResumed(_) => "update:download-resumed",
            UiEvent::Error(_) => "update:error",
            UiEvent::InstallRequest(_) => "update:install-request",
        }
    }
}

/// In-process broadcast bus towards the UI layer
#[derive(Debug, Clone)]
pub struct UiBus {
    sender: broadcast::Sender<UiEvent>,
    backlog: Arc<Mutex<VecDeque<UiEvent>>>,
}

impl Default for UiBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl UiBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            backlog: Arc::new(Mutex::new(VecDeque::with_capacity(BACKLOG_CAPACITY))),
        }
    }

    /// Publish without waiting; having no subscriber is not an error
    pub fn publish(&self, event: UiEvent) {
        log::debug!("[UiBus] {}", event.channel());
        {
            let mut backlog = self.backlog.lock();
            if backlog.len() == BACKLOG_CAPACITY {
                backlog.pop_front();
            }
            backlog.push_back(event.clone());
        }
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of recent events, oldest first
    pub fn recent(&self) -> Vec<UiEvent> {
        self.backlog.lock().iter().cloned().collect()
    }

    /// Recent events published on `channel`
    pub fn recent_on(&self, channel: &str) -> Vec<UiEvent> {
        self.backlog
            .lock()
            .iter()
            .filter(|event| event.channel() == channel)
            .cloned()
            .collect()
    }
}
