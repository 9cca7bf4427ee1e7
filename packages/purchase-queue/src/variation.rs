//! Product-to-variation attribution tables.
//!
//! Two parallel tables map a product identifier to the paywall variation it was
//! purchased under:
//!
//! - **session**: overwritten on every purchase attempt, cleared when the
//!   attempt's transaction settles.
//! - **persistent**: "last known attribution"; overwritten by new attempts but
//!   never cleared on settlement.
//!
//! Both tables are written through to durable storage on every change and emit
//! a [`DiagnosticEvent::VariationsUpdated`] carrying the full table.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::tap::{DiagnosticEvent, TapRegistry, VariationTable};
use crate::traits::BaseKeyValueStorage;

/// Storage key of the session table.
pub const SESSION_VARIATIONS_KEY: &str = "session-variation-map";

/// Storage key of the persistent table.
pub const PERSISTENT_VARIATIONS_KEY: &str = "persistent-variation-map";

/// Point-in-time copy of both tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VariationSnapshot {
    pub session: HashMap<String, String>,
    pub persistent: HashMap<String, String>,
}

pub struct VariationStore {
    session: HashMap<String, String>,
    persistent: HashMap<String, String>,
    storage: Arc<dyn BaseKeyValueStorage>,
    taps: TapRegistry,
}

impl VariationStore {
    /// Load both tables from storage.
    ///
    /// When storage has no persistent table yet it is seeded from the session
    /// table and saved immediately, so installs that predate the persistent
    /// table keep their attribution.
    pub fn load(storage: Arc<dyn BaseKeyValueStorage>, taps: TapRegistry) -> Self {
        let session = match storage.load(SESSION_VARIATIONS_KEY) {
            Ok(table) => table.unwrap_or_default(),
            Err(e) => {
                warn!(key = SESSION_VARIATIONS_KEY, error = %e, "failed to load variation table");
                HashMap::new()
            }
        };

        let mut store = Self {
            persistent: HashMap::new(),
            session,
            storage,
            taps,
        };

        match store.storage.load(PERSISTENT_VARIATIONS_KEY) {
            Ok(Some(table)) => store.persistent = table,
            Ok(None) => {
                store.persistent = store.session.clone();
                info!(
                    entries = store.persistent.len(),
                    "seeding persistent variation table from session table"
                );
                store.persist(VariationTable::Persistent);
            }
            // An unreadable table is not overwritten by the seed.
            Err(e) => {
                warn!(key = PERSISTENT_VARIATIONS_KEY, error = %e, "failed to load variation table");
                store.persistent = store.session.clone();
            }
        }

        store
    }

    /// Session variation for a product.
    pub fn get(&self, product_id: &str) -> Option<&str> {
        self.session.get(product_id).map(String::as_str)
    }

    /// Persistent (last known) variation for a product.
    pub fn get_persistent(&self, product_id: &str) -> Option<&str> {
        self.persistent.get(product_id).map(String::as_str)
    }

    /// Record the variation a product is being purchased under.
    ///
    /// Each table is only saved (and diagnosed) when its value actually changed.
    pub fn set(&mut self, product_id: &str, variation_id: &str) {
        if insert_changed(&mut self.session, product_id, variation_id) {
            self.save(VariationTable::Session);
        }
        self.set_persistent(product_id, variation_id);
    }

    /// Overwrite only the persistent attribution for a product.
    pub fn set_persistent(&mut self, product_id: &str, variation_id: &str) {
        if insert_changed(&mut self.persistent, product_id, variation_id) {
            self.save(VariationTable::Persistent);
        }
    }

    /// Drop the session entry for a product. The persistent table is untouched.
    pub fn remove(&mut self, product_id: &str) {
        if self.session.remove(product_id).is_some() {
            self.save(VariationTable::Session);
        }
    }

    pub fn snapshot(&self) -> VariationSnapshot {
        VariationSnapshot {
            session: self.session.clone(),
            persistent: self.persistent.clone(),
        }
    }

    fn table(&self, table: VariationTable) -> (&'static str, &HashMap<String, String>) {
        match table {
            VariationTable::Session => (SESSION_VARIATIONS_KEY, &self.session),
            VariationTable::Persistent => (PERSISTENT_VARIATIONS_KEY, &self.persistent),
        }
    }

    fn persist(&self, table: VariationTable) {
        let (key, values) = self.table(table);
        if let Err(e) = self.storage.save(key, values) {
            warn!(key, error = %e, "failed to persist variation table");
        }
    }

    /// Write-through plus diagnostic.
    fn save(&self, table: VariationTable) {
        self.persist(table);
        let (_, values) = self.table(table);
        self.taps.emit(DiagnosticEvent::VariationsUpdated {
            table,
            values: values.clone(),
        });
    }
}

impl std::fmt::Debug for VariationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VariationStore")
            .field("session", &self.session)
            .field("persistent", &self.persistent)
            .finish_non_exhaustive()
    }
}

fn insert_changed(table: &mut HashMap<String, String>, key: &str, value: &str) -> bool {
    if table.get(key).map(String::as_str) == Some(value) {
        return false;
    }
    table.insert(key.to_string(), value.to_string());
    true
}
