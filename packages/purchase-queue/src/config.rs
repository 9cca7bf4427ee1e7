use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::persistence::{InMemoryStorage, JsonFileStorage};
use crate::traits::BaseKeyValueStorage;

/// Default number of settled transaction ids remembered for duplicate suppression
pub const DEFAULT_SETTLED_HISTORY: usize = 1024;

/// Process-wide observer mode flag.
///
/// While enabled the coordinator never finalizes transactions; an external
/// system of record is assumed to do it. Read at every terminal transition, so
/// flipping it takes effect on the next event.
#[derive(Debug, Clone, Default)]
pub struct ObserverMode(Arc<AtomicBool>);

impl ObserverMode {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

/// Coordinator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub observer_mode: ObserverMode,
    /// Directory for JSON file storage; in-memory storage when unset
    pub storage_dir: Option<PathBuf>,
    pub settled_history: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            observer_mode: ObserverMode::default(),
            storage_dir: None,
            settled_history: DEFAULT_SETTLED_HISTORY,
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            observer_mode: ObserverMode::new(
                parse_flag(env::var("PURCHASE_QUEUE_OBSERVER_MODE").ok().as_deref())
                    .context("PURCHASE_QUEUE_OBSERVER_MODE must be true/false/1/0")?,
            ),
            storage_dir: env::var("PURCHASE_QUEUE_STORAGE_DIR")
                .ok()
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
            settled_history: env::var("PURCHASE_QUEUE_SETTLED_HISTORY")
                .unwrap_or_else(|_| DEFAULT_SETTLED_HISTORY.to_string())
                .parse()
                .context("PURCHASE_QUEUE_SETTLED_HISTORY must be a valid number")?,
        })
    }

    pub fn with_observer_mode(self, enabled: bool) -> Self {
        self.observer_mode.set(enabled);
        self
    }

    pub fn with_settled_history(mut self, settled_history: usize) -> Self {
        self.settled_history = settled_history;
        self
    }

    /// Open the configured storage backend
    pub fn open_storage(&self) -> Result<Arc<dyn BaseKeyValueStorage>> {
        match &self.storage_dir {
            Some(dir) => {
                let storage = JsonFileStorage::open(dir)
                    .with_context(|| format!("Failed to open storage at {}", dir.display()))?;
                Ok(Arc::new(storage))
            }
            None => Ok(Arc::new(InMemoryStorage::new())),
        }
    }
}

fn parse_flag(raw: Option<&str>) -> Result<bool> {
    match raw.map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if v.is_empty() => Ok(false),
        Some(v) => match v.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => anyhow::bail!("invalid flag value: {}", other),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(!parse_flag(None).unwrap());
        assert!(!parse_flag(Some("")).unwrap());
        assert!(parse_flag(Some("TRUE")).unwrap());
        assert!(parse_flag(Some("1")).unwrap());
        assert!(!parse_flag(Some("0")).unwrap());
        assert!(parse_flag(Some("yes")).is_err());
    }

    #[test]
    fn test_observer_mode_is_shared_between_clones() {
        let mode = ObserverMode::default();
        let other = mode.clone();

        other.set(true);
        assert!(mode.is_enabled());
    }

    #[test]
    fn test_default_config_uses_memory_storage() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.settled_history, DEFAULT_SETTLED_HISTORY);
        assert!(!config.observer_mode.is_enabled());

        let storage = config.open_storage().unwrap();
        assert!(storage.load("session-variation-map").unwrap().is_none());
    }

    #[test]
    fn test_storage_dir_opens_json_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoordinatorConfig {
            storage_dir: Some(dir.path().join("state")),
            ..CoordinatorConfig::default()
        };

        let storage = config.open_storage().unwrap();
        storage.save("session-variation-map", &Default::default()).unwrap();
        assert!(dir.path().join("state/session-variation-map.json").exists());
    }
}
