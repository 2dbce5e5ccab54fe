// Core types and enums for the update coordination engine
// Shared by the check, download, postpone and notification components

use serde::{Deserialize, Serialize};

/// Messages the delivery engine uses when there is simply nothing newer
const TERMINAL_MARKERS: &[&str] = &[
    "no published version",
    "cannot find latest",
    "no updates available",
];

/// Messages that identify a retryable network failure
const NETWORK_MARKERS: &[&str] = &[
    "enotfound",
    "etimedout",
    "econnrefused",
    "econnreset",
    "econnaborted",
    "timeout",
    "timed out",
];

/// Messages the engine produces when a transfer was aborted on request
const CANCELLATION_MARKERS: &[&str] = &["cancelled", "canceled", "aborted"];

/// Messages that point at the transfer or the downloaded artifact
const DOWNLOAD_MARKERS: &[&str] = &["download", "checksum", "sha512", "corrupt", "integrity"];

fn contains_any(message: &str, markers: &[&str]) -> bool {
    let lower = message.to_lowercase();
    markers.iter().any(|marker| lower.contains(marker))
}

/// "No newer version" style message, never an error for the user
pub fn is_terminal_message(message: &str) -> bool {
    contains_any(message, TERMINAL_MARKERS)
}

/// DNS / connect / timeout failure worth retrying
pub fn is_network_message(message: &str) -> bool {
    contains_any(message, NETWORK_MARKERS)
}

/// Whole-word match, so codes like `ECONNABORTED` stay network errors
pub fn is_cancellation_message(message: &str) -> bool {
    message
        .split(|c: char| !c.is_ascii_alphanumeric())
        .map(str::to_lowercase)
        .any(|word| CANCELLATION_MARKERS.contains(&word.as_str()))
}

pub fn is_download_message(message: &str) -> bool {
    contains_any(message, DOWNLOAD_MARKERS)
}

/// Current wall-clock time in milliseconds since UNIX epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Release descriptor published by the delivery engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    /// Semantic version string (e.g., "2.1.0")
    pub version: String,

    /// Artifact URL; the engine resumes byte ranges when it is requested again
    #[serde(default)]
    pub download_url: String,

    /// Release notes, usually markdown or HTML
    #[serde(default)]
    pub release_notes: Option<String>,

    #[serde(default)]
    pub release_name: Option<String>,

    /// ISO 8601 publish date
    #[serde(default)]
    pub release_date: Option<String>,
}

impl UpdateInfo {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            download_url: String::new(),
            release_notes: None,
            release_name: None,
            release_date: None,
        }
    }
}

/// Outcome of a successful remote check that found a newer version
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub version: String,
    pub info: UpdateInfo,
    /// Epoch milliseconds when the engine answered
    pub timestamp: u64,
}

impl UpdateResult {
    pub fn new(info: UpdateInfo) -> Self {
        Self {
            version: info.version.clone(),
            info,
            timestamp: now_millis(),
        }
    }
}

/// Partial download progress, persisted so a crash or restart can resume
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownloadState {
    pub url: String,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub version: String,
    /// Epoch milliseconds of the last write
    pub timestamp: u64,
}

impl DownloadState {
    pub fn new(version: &str, url: &str) -> Self {
        Self {
            url: url.to_string(),
            downloaded_bytes: 0,
            total_bytes: 0,
            version: version.to_string(),
            timestamp: now_millis(),
        }
    }

    /// Records a progress report, keeping downloaded <= total
    pub fn apply_progress(&mut self, transferred: u64, total: u64) {
        self.total_bytes = total;
        self.downloaded_bytes = if total > 0 {
            transferred.min(total)
        } else {
            transferred
        };
        self.timestamp = now_millis();
    }

    pub fn is_expired(&self, now_ms: u64, max_age_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp) > max_age_ms
    }

    /// Progress as percentage (0.0 - 100.0)
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.downloaded_bytes as f64 / self.total_bytes as f64) * 100.0
    }
}

/// Which cooldown bucket an error falls into
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Download,
    Check,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Download => write!(f, "download"),
            ErrorKind::Check => write!(f, "check"),
        }
    }
}

/// Last error seen by the notifier, exposed to callers of the subsystem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    pub message: String,
    /// Epoch milliseconds
    pub timestamp: u64,
    pub kind: ErrorKind,
}

/// Where the update lifecycle currently stands
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", content = "data")]
pub enum UpdatePhase {
    /// No newer version known
    #[default]
    NoUpdate,

    /// A newer version was found and not yet downloaded
    Available(UpdateInfo),

    /// Transfer running or paused with recoverable progress
    Downloading(DownloadState),

    /// Artifact is on disk and ready to install
    Downloaded(UpdateInfo),
}

/// Error taxonomy for update operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "message")]
pub enum UpdateError {
    /// No newer version exists
    TerminalCheck(String),

    /// DNS, connection or timeout failure
    TransientNetwork(String),

    /// Retries exhausted or unclassified check failure
    UnexpectedCheck(String),

    /// Checksum, corruption, disk or network failure during transfer
    DownloadFailure(String),

    /// Transfer stopped by a pause or cancel request
    UserCancellation,

    /// Operation not allowed in the current state
    InvalidState {
        current: String,
        attempted: String,
    },

    /// Persistence adapter failure
    Persistence(String),

    /// Configuration error
    Config(String),
}

impl UpdateError {
    /// Raw message without the category prefix
    pub fn message(&self) -> String {
        match self {
            UpdateError::TerminalCheck(msg)
            | UpdateError::TransientNetwork(msg)
            | UpdateError::UnexpectedCheck(msg)
            | UpdateError::DownloadFailure(msg)
            | UpdateError::Persistence(msg)
            | UpdateError::Config(msg) => msg.clone(),
            UpdateError::UserCancellation => "download cancelled by user".to_string(),
            UpdateError::InvalidState { current, attempted } => {
                format!("cannot {} while {}", attempted, current)
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            UpdateError::TerminalCheck(_) => true,
            other => is_terminal_message(&other.message()),
        }
    }

    pub fn is_network(&self) -> bool {
        match self {
            UpdateError::TransientNetwork(_) => true,
            other => is_network_message(&other.message()),
        }
    }
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::TerminalCheck(msg) => write!(f, "No update available: {}", msg),
            UpdateError::TransientNetwork(msg) => write!(f, "Network error: {}", msg),
            UpdateError::UnexpectedCheck(msg) => write!(f, "Update check failed: {}", msg),
            UpdateError::DownloadFailure(msg) => write!(f, "Download failed: {}", msg),
            UpdateError::UserCancellation => write!(f, "Download cancelled by user"),
            UpdateError::InvalidState { current, attempted } => {
                write!(f, "Cannot {} while {}", attempted, current)
            }
            UpdateError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            UpdateError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for UpdateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_phase_default() {
        assert_eq!(UpdatePhase::default(), UpdatePhase::NoUpdate);
    }

    #[test]
    fn test_download_state_uses_camel_case_keys() {
        let state = DownloadState {
            url: "https://updates.example.com/pos-2.0.0.exe".to_string(),
            downloaded_bytes: 500,
            total_bytes: 1000,
            version: "2.0.0".to_string(),
            timestamp: 1_700_000_000_000,
        };

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["downloadedBytes"], 500);
        assert_eq!(json["totalBytes"], 1000);
        assert_eq!(json["timestamp"], 1_700_000_000_000u64);
    }

    #[test]
    fn test_apply_progress_clamps_to_total() {
        let mut state = DownloadState::new("2.0.0", "");
        state.apply_progress(1500, 1000);
        assert_eq!(state.downloaded_bytes, 1000);
        assert_eq!(state.percent(), 100.0);

        state.apply_progress(250, 1000);
        assert_eq!(state.downloaded_bytes, 250);
    }

    #[test]
    fn test_apply_progress_unknown_total() {
        let mut state = DownloadState::new("2.0.0", "");
        state.apply_progress(300, 0);
        assert_eq!(state.downloaded_bytes, 300);
        assert_eq!(state.percent(), 0.0);
    }

    #[test]
    fn test_download_state_expiry() {
        let mut state = DownloadState::new("2.0.0", "");
        state.timestamp = 1_000;
        assert!(!state.is_expired(1_000 + 86_400_000, 86_400_000));
        assert!(state.is_expired(1_000 + 86_400_001, 86_400_000));
    }

    #[test]
    fn test_message_classification() {
        assert!(is_terminal_message("No published versions on GitHub"));
        assert!(is_terminal_message("Cannot find latest.yml in the latest release"));
        assert!(is_network_message("getaddrinfo ENOTFOUND updates.example.com"));
        assert!(is_network_message("connect ECONNREFUSED 127.0.0.1:443"));
        assert!(is_network_message("Request timed out"));
        assert!(!is_network_message("HTTP 500 Internal Server Error"));
        assert!(is_cancellation_message("Download was cancelled"));
        assert!(is_cancellation_message("Request aborted"));
        assert!(!is_cancellation_message("read ECONNABORTED"));
        assert!(is_download_message("sha512 checksum mismatch"));
    }

    #[test]
    fn test_update_error_display() {
        let error = UpdateError::InvalidState {
            current: "downloading".to_string(),
            attempted: "start download".to_string(),
        };
        assert_eq!(error.to_string(), "Cannot start download while downloading");
        assert!(UpdateError::TransientNetwork("x".to_string()).is_network());
        assert!(UpdateError::UnexpectedCheck("ETIMEDOUT".to_string()).is_network());
        assert!(UpdateError::TerminalCheck("x".to_string()).is_terminal());
    }

    #[test]
    fn test_update_error_serialization() {
        let error = UpdateError::DownloadFailure("sha512 checksum mismatch".to_string());
        let json = serde_json::to_string(&error).unwrap();
        let deserialized: UpdateError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, deserialized);
    }
}
