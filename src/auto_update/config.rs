// Update Configuration
// Timing constants for the update engine, loaded from / saved to a JSON file

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auto_update::UpdateError;

/// Configuration file name
const CONFIG_FILE_NAME: &str = "update_config.json";

/// Configuration for the update engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpdateConfig {
    /// Debounce window for concurrent check requests (default: 2s)
    pub debounce_ms: u64,

    /// How long a successful check result stays fresh (default: 15 min)
    pub cache_ttl_ms: u64,

    /// Per-attempt timeout for the engine's check call (default: 10s)
    pub check_timeout_ms: u64,

    /// Total attempts for network-class failures, first try included
    pub max_check_attempts: u32,

    /// Linear backoff step: delay = step * attempt
    pub retry_backoff_ms: u64,

    /// Background check interval in seconds (default: 14400 = 4 hours)
    pub check_interval_secs: u64,

    /// Delay before the first background check after startup
    pub startup_check_delay_secs: u64,

    /// Background checks are skipped once no window had focus for this long
    pub idle_threshold_secs: u64,

    /// Reminder delay after the user postponed an update (default: 2 hours)
    pub reminder_interval_secs: u64,

    /// Postponements after which reminders escalate
    pub max_postpone: u32,

    /// Minimum gap between two UI prompts of the same error kind
    pub error_cooldown_ms: u64,

    /// Persisted download progress older than this is discarded (default: 24h)
    pub max_download_age_ms: u64,

    /// Character budget for formatted release notes
    pub release_notes_budget: usize,

    /// Number of versions kept in the release notes cache
    pub release_notes_capacity: usize,

    /// Errors only reach the UI in packaged builds
    pub production: bool,

    /// Page offered to the user for manual downloads
    pub releases_url: String,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            cache_ttl_ms: 15 * 60 * 1000,
            check_timeout_ms: 10_000,
            max_check_attempts: 3,
            retry_backoff_ms: 2_000,
            check_interval_secs: 14_400, // 4 hours
            startup_check_delay_secs: 10,
            idle_threshold_secs: 30 * 60,
            reminder_interval_secs: 2 * 60 * 60,
            max_postpone: 3,
            error_cooldown_ms: 60_000,
            max_download_age_ms: 86_400_000,
            release_notes_budget: 600,
            release_notes_capacity: 5,
            production: true,
            releases_url: "https://updates.pos-terminal.app/releases".to_string(),
        }
    }
}

impl UpdateConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based): 2000ms, 4000ms, ...
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn startup_check_delay(&self) -> Duration {
        Duration::from_secs(self.startup_check_delay_secs)
    }

    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn reminder_interval(&self) -> Duration {
        Duration::from_secs(self.reminder_interval_secs)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_millis(self.error_cooldown_ms)
    }

    /// Reject values that would make the engine spin or never retry
    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.max_check_attempts == 0 {
            return Err(UpdateError::Config(
                "max_check_attempts must be at least 1".to_string(),
            ));
        }
        if self.check_interval_secs == 0 {
            return Err(UpdateError::Config(
                "check_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.release_notes_capacity == 0 {
            return Err(UpdateError::Config(
                "release_notes_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Get the configuration file path
/// Stores in app data directory: ~/.pos-terminal/update_config.json
pub fn get_config_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".pos-terminal").join(CONFIG_FILE_NAME)
}

/// Load update configuration from file
/// Returns default config if file doesn't exist or is invalid
pub fn load_config() -> UpdateConfig {
    load_config_from(&get_config_path())
}

pub fn load_config_from(config_path: &Path) -> UpdateConfig {
    if !config_path.exists() {
        log::info!("[UpdateConfig] Config file not found, using defaults");
        return UpdateConfig::default();
    }

    let content = match fs::read_to_string(config_path) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("[UpdateConfig] Failed to read config: {}, using defaults", e);
            return UpdateConfig::default();
        }
    };

    match serde_json::from_str::<UpdateConfig>(&content) {
        Ok(config) => match config.validate() {
            Ok(()) => {
                log::info!("[UpdateConfig] Loaded config from {:?}", config_path);
                config
            }
            Err(e) => {
                log::warn!("[UpdateConfig] {}, using defaults", e);
                UpdateConfig::default()
            }
        },
        Err(e) => {
            log::warn!("[UpdateConfig] Failed to parse config: {}, using defaults", e);
            UpdateConfig::default()
        }
    }
}

/// Save update configuration to file
pub fn save_config(config: &UpdateConfig) -> Result<(), UpdateError> {
    save_config_to(config, &get_config_path())
}

pub fn save_config_to(config: &UpdateConfig, config_path: &Path) -> Result<(), UpdateError> {
    config.validate()?;

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            UpdateError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }

    let json = serde_json::to_string_pretty(config)
        .map_err(|e| UpdateError::Config(format!("Failed to serialize config: {}", e)))?;

    fs::write(config_path, json)
        .map_err(|e| UpdateError::Config(format!("Failed to write config: {}", e)))?;

    log::info!("[UpdateConfig] Saved config to {:?}", config_path);
    Ok(())
}
