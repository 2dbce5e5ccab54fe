// Update Logger - dedicated log file for the update engine
// Keeps a support-friendly trail of checks, downloads and errors with rotation

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::auto_update::types::{now_millis, DownloadState};

/// Maximum log file size before rotation (10MB)
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Number of rotated log files to keep
const MAX_ROTATED_FILES: usize = 5;

/// Progress is logged every 10% or every 30 seconds
const PROGRESS_STEP_PERCENT: u8 = 10;
const PROGRESS_INTERVAL_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// A single line in the update log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateLogEntry {
    /// Epoch milliseconds
    pub timestamp: u64,
    pub level: LogLevel,
    /// Component or phase that wrote the entry (e.g. "check", "download")
    pub phase: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl UpdateLogEntry {
    pub fn new(level: LogLevel, phase: &str, message: &str) -> Self {
        Self {
            timestamp: now_millis(),
            level,
            phase: phase.to_string(),
            message: message.to_string(),
            details: None,
        }
    }

    pub fn with_details(
        level: LogLevel,
        phase: &str,
        message: &str,
        details: serde_json::Value,
    ) -> Self {
        Self {
            details: Some(details),
            ..Self::new(level, phase, message)
        }
    }

    /// `[2024-01-01T00:00:00.000Z] [INFO] [check] message | {"k":1}`
    pub fn format(&self) -> String {
        let datetime = Utc
            .timestamp_millis_opt(self.timestamp as i64)
            .single()
            .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
            .unwrap_or_else(|| self.timestamp.to_string());
        let details = self
            .details
            .as_ref()
            .map(|d| format!(" | {}", d))
            .unwrap_or_default();

        format!(
            "[{}] [{}] [{}] {}{}",
            datetime, self.level, self.phase, self.message, details
        )
    }
}

#[derive(Debug, Default)]
struct ProgressMark {
    percent: u8,
    at_ms: u64,
}

/// Writes update log entries to `<dir>/update.log`, rotating at a size limit
pub struct UpdateLogger {
    log_file_path: PathBuf,
    max_file_size: u64,
    file_lock: Mutex<()>,
    last_progress: Mutex<ProgressMark>,
}

impl UpdateLogger {
    pub fn new(log_dir: &Path) -> std::io::Result<Self> {
        Self::with_max_size(log_dir, MAX_LOG_FILE_SIZE)
    }

    pub fn with_max_size(log_dir: &Path, max_file_size: u64) -> std::io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        Ok(Self {
            log_file_path: log_dir.join("update.log"),
            max_file_size,
            file_lock: Mutex::new(()),
            last_progress: Mutex::new(ProgressMark::default()),
        })
    }

    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn log(&self, entry: &UpdateLogEntry) -> std::io::Result<()> {
        let _lock = self.file_lock.lock();

        self.rotate_if_needed()?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)?;

        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", entry.format())?;
        writer.flush()
    }

    /// Log download progress only on 10% steps or after 30 seconds
    pub fn log_progress(&self, state: &DownloadState) -> std::io::Result<()> {
        let percent = state.percent() as u8;
        let now = now_millis();

        {
            let mut last = self.last_progress.lock();
            let step_reached =
                percent >= last.percent.saturating_add(PROGRESS_STEP_PERCENT) || percent < last.percent;
            let interval_reached = now >= last.at_ms + PROGRESS_INTERVAL_MS;
            if !step_reached && !interval_reached {
                return Ok(());
            }
            last.percent = percent;
            last.at_ms = now;
        }

        let message = format!(
            "Download progress {}: {}% ({} / {} bytes)",
            state.version, percent, state.downloaded_bytes, state.total_bytes
        );
        self.log(&UpdateLogEntry::new(LogLevel::Info, "download", &message))
    }

    /// Call when a new transfer starts
    pub fn reset_progress_tracking(&self) {
        *self.last_progress.lock() = ProgressMark::default();
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        if !self.log_file_path.exists() {
            return Ok(());
        }
        if fs::metadata(&self.log_file_path)?.len() >= self.max_file_size {
            self.rotate_logs()?;
        }
        Ok(())
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        let log_dir = self.log_file_path.parent().unwrap_or(Path::new("."));
        log_dir.join(format!("update.{}.log", index))
    }

    fn rotate_logs(&self) -> std::io::Result<()> {
        let oldest = self.rotated_path(MAX_ROTATED_FILES);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }

        for i in (1..MAX_ROTATED_FILES).rev() {
            let old_path = self.rotated_path(i);
            if old_path.exists() {
                fs::rename(&old_path, self.rotated_path(i + 1))?;
            }
        }

        fs::rename(&self.log_file_path, self.rotated_path(1))
    }

    /// Current + rotated log files, newest first
    pub fn list_log_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if self.log_file_path.exists() {
            files.push(self.log_file_path.clone());
        }
        for i in 1..=MAX_ROTATED_FILES {
            let rotated = self.rotated_path(i);
            if rotated.exists() {
                files.push(rotated);
            }
        }
        files
    }
}

/// Optional handle to the update log used by the components.
/// Write failures are reported through `log` and never propagate.
#[derive(Clone, Default)]
pub struct UpdateJournal {
    logger: Option<Arc<UpdateLogger>>,
}

impl UpdateJournal {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(logger: Arc<UpdateLogger>) -> Self {
        Self {
            logger: Some(logger),
        }
    }

    fn write(&self, entry: UpdateLogEntry) {
        if let Some(logger) = &self.logger {
            if let Err(e) = logger.log(&entry) {
                log::warn!("[UpdateLogger] Failed to write update log: {}", e);
            }
        }
    }

    pub fn info(&self, phase: &str, message: &str) {
        self.write(UpdateLogEntry::new(LogLevel::Info, phase, message));
    }

    pub fn warn(&self, phase: &str, message: &str) {
        self.write(UpdateLogEntry::new(LogLevel::Warn, phase, message));
    }

    pub fn error(&self, phase: &str, message: &str, details: serde_json::Value) {
        self.write(UpdateLogEntry::with_details(
            LogLevel::Error,
            phase,
            message,
            details,
        ));
    }

    pub fn progress(&self, state: &DownloadState) {
        if let Some(logger) = &self.logger {
            if let Err(e) = logger.log_progress(state) {
                log::warn!("[UpdateLogger] Failed to write progress: {}", e);
            }
        }
    }

    pub fn reset_progress(&self) {
        if let Some(logger) = &self.logger {
            logger.reset_progress_tracking();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_log(logger: &UpdateLogger) -> String {
        fs::read_to_string(logger.log_file_path()).unwrap_or_default()
    }

    #[test]
    fn test_log_entry_format() {
        let entry = UpdateLogEntry {
            timestamp: 1_704_067_200_000, // 2024-01-01 00:00:00 UTC
            level: LogLevel::Info,
            phase: "check".to_string(),
            message: "Update 2.0.0 available".to_string(),
            details: None,
        };
        assert_eq!(
            entry.format(),
            "[2024-01-01T00:00:00.000Z] [INFO] [check] Update 2.0.0 available"
        );
    }

    #[test]
    fn test_log_entry_format_with_details() {
        let entry = UpdateLogEntry::with_details(
            LogLevel::Error,
            "download",
            "Transfer failed",
            serde_json::json!({ "version": "2.0.0" }),
        );
        let formatted = entry.format();
        assert!(formatted.contains("[ERROR] [download] Transfer failed"));
        assert!(formatted.ends_with(r#"| {"version":"2.0.0"}"#));
    }

    #[test]
    fn test_logger_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logger = UpdateLogger::new(dir.path()).unwrap();

        logger
            .log(&UpdateLogEntry::new(LogLevel::Info, "check", "first"))
            .unwrap();
        logger
            .log(&UpdateLogEntry::new(LogLevel::Warn, "check", "second"))
            .unwrap();

        let content = read_log(&logger);
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("[WARN] [check] second"));
    }

    #[test]
    fn test_progress_is_throttled_to_ten_percent_steps() {
        let dir = tempfile::tempdir().unwrap();
        let logger = UpdateLogger::new(dir.path()).unwrap();
        let mut state = DownloadState::new("2.0.0", "");

        for transferred in [50, 100, 120, 150, 210, 990, 1000] {
            state.apply_progress(transferred, 1000);
            logger.log_progress(&state).unwrap();
        }

        // 5% (first write), then 15% and 99%
        let content = read_log(&logger);
        assert_eq!(content.lines().count(), 3);
        assert!(content.contains("99% (990 / 1000 bytes)"));
    }

    #[test]
    fn test_rotation_keeps_max_files() {
        let dir = tempfile::tempdir().unwrap();
        let logger = UpdateLogger::with_max_size(dir.path(), 10).unwrap();

        for i in 0..(MAX_ROTATED_FILES + 3) {
            logger
                .log(&UpdateLogEntry::new(LogLevel::Info, "check", &format!("entry {}", i)))
                .unwrap();
        }

        let files = logger.list_log_files();
        assert_eq!(files.len(), MAX_ROTATED_FILES + 1);
        assert!(read_log(&logger).contains(&format!("entry {}", MAX_ROTATED_FILES + 2)));
    }

    #[test]
    fn test_disabled_journal_is_noop() {
        let journal = UpdateJournal::disabled();
        journal.info("check", "nothing happens");
        journal.progress(&DownloadState::new("2.0.0", ""));
    }

    #[test]
    fn test_journal_writes_through_logger() {
        let dir = tempfile::tempdir().unwrap();
        let logger = Arc::new(UpdateLogger::new(dir.path()).unwrap());
        let journal = UpdateJournal::new(logger.clone());

        journal.error("download", "Transfer failed", serde_json::json!({ "code": 1 }));
        assert!(read_log(&logger).contains("[ERROR] [download] Transfer failed"));
    }
}
