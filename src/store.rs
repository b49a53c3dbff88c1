// ============================================================================
// Store Definitions & Resident Records
// ============================================================================

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::core::{Result, SyncError};
use crate::engine::Engine;
use crate::record::{Record, RecordHandle};

/// Migrates a payload from schema version k to k+1, in place.
pub type MigrationFn = Arc<dyn Fn(&mut Value) -> Result<()> + Send + Sync>;

/// Definition of a named store: template for unseen keys, ordered
/// migration chain, and the auto-save override.
#[derive(Clone)]
pub struct StoreConfig {
    pub name: String,

    /// Default payload for keys never stored before
    pub template_data: Value,

    /// Caller-defined default metadata fields. Session and version fields
    /// are reserved and seeded by the engine.
    pub template_metadata: serde_json::Map<String, Value>,

    /// Migration i upgrades payloads from version i to i+1
    pub migrations: Vec<MigrationFn>,

    /// Per-store auto-save override; `None` uses the engine default
    pub auto_save: Option<bool>,
}

impl StoreConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template_data: Value::Object(serde_json::Map::new()),
            template_metadata: serde_json::Map::new(),
            migrations: Vec::new(),
            auto_save: None,
        }
    }

    pub fn with_template_data(mut self, data: Value) -> Self {
        self.template_data = data;
        self
    }

    pub fn with_template_metadata(mut self, metadata: serde_json::Map<String, Value>) -> Self {
        self.template_metadata = metadata;
        self
    }

    /// Append the next migration step. The first appended migration
    /// upgrades version 0 to 1, the second 1 to 2, and so on.
    pub fn with_migration<F>(mut self, migration: F) -> Self
    where
        F: Fn(&mut Value) -> Result<()> + Send + Sync + 'static,
    {
        self.migrations.push(Arc::new(migration));
        self
    }

    pub fn with_auto_save(mut self, enabled: bool) -> Self {
        self.auto_save = Some(enabled);
        self
    }
}

/// A named store plus its resident records. Created once per name,
/// lives for the engine's lifetime.
pub(crate) struct Store {
    config: StoreConfig,
    records: Mutex<HashMap<String, Arc<Record>>>,
}

impl Store {
    pub(crate) fn new(config: StoreConfig) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn template_data(&self) -> &Value {
        &self.config.template_data
    }

    pub(crate) fn template_metadata(&self) -> &serde_json::Map<String, Value> {
        &self.config.template_metadata
    }

    /// Latest schema version = number of registered migrations.
    pub(crate) fn latest_version(&self) -> u32 {
        self.config.migrations.len() as u32
    }

    pub(crate) fn apply_migration(&self, index: usize, data: &mut Value) -> Result<()> {
        let migration = self.config.migrations.get(index).ok_or_else(|| {
            SyncError::MigrationFailed {
                index,
                message: "no migration registered for this version".to_string(),
            }
        })?;
        migration(data)
    }

    pub(crate) fn auto_save_enabled(&self, global_default: bool) -> bool {
        self.config.auto_save.unwrap_or(global_default)
    }

    /// Register a new resident record for `key`. Fails while another
    /// record for the same key is resident.
    pub(crate) fn insert_record(&self, key: &str, record: Arc<Record>) -> Result<()> {
        let mut records = self.records.lock()?;
        if records.contains_key(key) {
            return Err(SyncError::AlreadyResident {
                store: self.config.name.clone(),
                key: key.to_string(),
            });
        }
        records.insert(key.to_string(), record);
        Ok(())
    }

    /// Drop a record from the resident set, if it is still the one
    /// registered under its key.
    pub(crate) fn remove_record(&self, key: &str, record: &Arc<Record>) {
        if let Ok(mut records) = self.records.lock()
            && let Some(current) = records.get(key)
            && Arc::ptr_eq(current, record)
        {
            records.remove(key);
        }
    }

    pub(crate) fn resident(&self) -> Vec<Arc<Record>> {
        match self.records.lock() {
            Ok(records) => records.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub(crate) fn resident_count(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }
}

/// Public handle to a named store.
#[derive(Clone)]
pub struct StoreHandle {
    pub(crate) engine: Arc<Engine>,
    pub(crate) store: Arc<Store>,
}

impl StoreHandle {
    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Materialize a record for `key`. At most one record per key may be
    /// resident; a second open while the first is resident fails with
    /// `AlreadyResident`.
    pub fn open(&self, key: &str) -> Result<RecordHandle> {
        if self.engine.is_shutting_down() {
            return Err(SyncError::ShuttingDown);
        }
        let record = Record::open(self.store.clone(), key)?;
        Ok(RecordHandle {
            engine: self.engine.clone(),
            record,
        })
    }

    pub fn resident_count(&self) -> usize {
        self.store.resident_count()
    }
}
