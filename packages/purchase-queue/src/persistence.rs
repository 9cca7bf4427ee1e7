//! Durable key-value storage for small string maps.
//!
//! # The Contract
//!
//! 1. **Load once.** The coordinator reads each key once, at construction.
//!
//! 2. **Write-through.** Every mutation of a stored table is saved immediately.
//!    There is no batching and no flush step.
//!
//! 3. **Synchronous from the coordinator's view.** `save` returns when the write
//!    is done. Implementations must never call back into the coordinator.
//!
//! # What This Does NOT Guarantee
//!
//! - No cross-key atomicity. Each key is written independently.
//! - No history. Only the latest map per key is kept.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};

use crate::traits::BaseKeyValueStorage;

// =============================================================================
// In-Memory Storage
// =============================================================================

/// Storage backed by a HashMap. Contents are lost on restart.
pub struct InMemoryStorage {
    data: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
        }
    }

    /// Seed a key before handing the storage to a coordinator.
    pub fn with_entry(self, key: &str, values: HashMap<String, String>) -> Self {
        if let Ok(mut data) = self.data.lock() {
            data.insert(key.to_string(), values);
        }
        self
    }

    /// Current contents of a key.
    pub fn get(&self, key: &str) -> Option<HashMap<String, String>> {
        self.data.lock().ok()?.get(key).cloned()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseKeyValueStorage for InMemoryStorage {
    fn load(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let data = self
            .data
            .lock()
            .map_err(|e| anyhow!("mutex poisoned: {}", e))?;
        Ok(data.get(key).cloned())
    }

    fn save(&self, key: &str, values: &HashMap<String, String>) -> Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|e| anyhow!("mutex poisoned: {}", e))?;
        data.insert(key.to_string(), values.clone());
        Ok(())
    }
}

// =============================================================================
// JSON File Storage
// =============================================================================

/// Storage that keeps one `<key>.json` file per key inside a directory.
///
/// Writes go to a temporary file that is renamed over the previous one, so a
/// crash mid-write leaves the last complete map in place.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    dir: PathBuf,
}

impl JsonFileStorage {
    /// Open (and create if needed) a storage directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create storage dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            bail!("invalid storage key: {:?}", key);
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl BaseKeyValueStorage for JsonFileStorage {
    fn load(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let path = self.path_for(key)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let values = serde_json::from_str(&raw)
            .with_context(|| format!("corrupt storage file {}", path.display()))?;
        Ok(Some(values))
    }

    fn save(&self, key: &str, values: &HashMap<String, String>) -> Result<()> {
        let path = self.path_for(key)?;
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_vec_pretty(values)?;
        fs::write(&tmp, raw).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}
