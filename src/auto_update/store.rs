// Persistence Adapter
// Durable key/value storage used for download crash recovery

use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::auto_update::UpdateError;

/// State file name
const STATE_FILE_NAME: &str = "update_state.json";

/// Durable key -> JSON value store
pub trait PersistenceAdapter: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, UpdateError>;

    /// Fully replaces any previous value under `key`
    fn set(&self, key: &str, value: Value) -> Result<(), UpdateError>;

    fn delete(&self, key: &str) -> Result<(), UpdateError>;
}

/// In-memory store, for tests and hosts that provide no durable storage
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceAdapter for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, UpdateError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), UpdateError> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), UpdateError> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON document on disk
///
/// Every write rewrites the whole document through a temp file and a rename,
/// so a crash mid-write leaves the previous document intact.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Store in the app data directory: ~/.pos-terminal/update_state.json
    pub fn with_default_path() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".pos-terminal").join(STATE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Map<String, Value>, UpdateError> {
        if !self.path.exists() {
            return Ok(Map::new());
        }

        let content = fs::read_to_string(&self.path).map_err(|e| {
            UpdateError::Persistence(format!("Failed to read state file: {}", e))
        })?;

        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => {
                log::warn!(
                    "[JsonFileStore] Ignoring unreadable state file {:?}",
                    self.path
                );
                Ok(Map::new())
            }
        }
    }

    fn write_document(&self, document: &Map<String, Value>) -> Result<(), UpdateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                UpdateError::Persistence(format!("Failed to create state directory: {}", e))
            })?;
        }

        let json = serde_json::to_string_pretty(document)
            .map_err(|e| UpdateError::Persistence(format!("Failed to serialize state: {}", e)))?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, json).map_err(|e| {
            UpdateError::Persistence(format!("Failed to write state file: {}", e))
        })?;
        fs::rename(&temp_path, &self.path).map_err(|e| {
            UpdateError::Persistence(format!("Failed to replace state file: {}", e))
        })?;

        Ok(())
    }
}

impl PersistenceAdapter for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, UpdateError> {
        let _guard = self.lock.lock();
        Ok(self.read_document()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), UpdateError> {
        let _guard = self.lock.lock();
        let mut document = self.read_document()?;
        document.insert(key.to_string(), value);
        self.write_document(&document)
    }

    fn delete(&self, key: &str) -> Result<(), UpdateError> {
        let _guard = self.lock.lock();
        let mut document = self.read_document()?;
        if document.remove(key).is_some() {
            self.write_document(&document)?;
        }
        Ok(())
    }
}
