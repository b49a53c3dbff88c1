// ============================================================================
// Engine State
// ============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::EngineConfig;
use crate::core::{Result, SyncError};
use crate::notify::Completion;
use crate::queue::RequestQueue;
use crate::record::Record;
use crate::remote::RemoteStore;
use crate::store::{Store, StoreConfig};

/// Process-wide engine state: the store registry, the request queue, and
/// the remote collaborator. Owned by a single `KeySync` instance with an
/// explicit lifecycle, so tests get a fresh world per instance.
pub(crate) struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) remote: Arc<dyn RemoteStore>,
    stores: StdMutex<HashMap<String, Arc<Store>>>,
    pub(crate) queue: Mutex<RequestQueue>,
    shutting_down: AtomicBool,
}

impl Engine {
    pub(crate) fn new(config: EngineConfig, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            config,
            remote,
            stores: StdMutex::new(HashMap::new()),
            queue: Mutex::new(RequestQueue::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Idempotent get-or-create by name. The first registration's config
    /// wins; later calls for the same name return the existing store.
    pub(crate) fn get_or_create_store(&self, config: StoreConfig) -> Result<Arc<Store>> {
        let mut stores = self.stores.lock()?;
        if let Some(existing) = stores.get(&config.name) {
            return Ok(existing.clone());
        }
        let store = Arc::new(Store::new(config));
        stores.insert(store.name().to_string(), store.clone());
        Ok(store)
    }

    pub(crate) fn stores_snapshot(&self) -> Vec<Arc<Store>> {
        match self.stores.lock() {
            Ok(stores) => stores.values().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Queue a read-modify-write for `record`. Returns `None` when an
    /// operation is already pending for it (at most one outstanding per
    /// record). The returned completion resolves when the operation
    /// finishes; the scheduler force-closes the record before resolving
    /// a failed one.
    pub(crate) async fn enqueue_update(
        &self,
        record: Arc<Record>,
        emergency: bool,
    ) -> Result<Option<Completion>> {
        if record.is_closed() {
            return Err(SyncError::RecordClosed(record.key().to_string()));
        }

        let mut queue = self.queue.lock().await;
        if queue.has_pending_for(&record) {
            return Ok(None);
        }
        let op = queue.enqueue(record.clone(), emergency);
        let completion = op.completion().clone();
        drop(queue);

        debug!(key = %record.key(), emergency, "operation enqueued");
        Ok(Some(completion))
    }
}
