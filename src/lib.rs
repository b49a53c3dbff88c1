// ============================================================================
// KeySync Library
// ============================================================================

pub mod checksum;
pub mod config;
pub mod core;
pub mod notify;
pub mod remote;
pub mod session;
pub mod store;

mod engine;
mod executor;
mod queue;
mod record;
mod scheduler;

pub use config::EngineConfig;
pub use core::{Result, SyncError};
pub use notify::Completion;
pub use record::RecordHandle;
pub use remote::{
    MemoryRemote, Metadata, RemoteError, RemoteStore, RequestClass, StoredValue, Transform,
    TransformFn,
};
pub use session::SessionId;
pub use store::{MigrationFn, StoreConfig, StoreHandle};

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::scheduler::{SchedulerWorker, spawn_scheduler_worker};

/// Access layer in front of a remote, rate-limited key-value store.
///
/// One `KeySync` instance owns the store registry, the request queue and
/// the scheduler worker; construct it once at process start and tear it
/// down with [`KeySync::shutdown`].
///
/// # Examples
///
/// ```
/// use keysync::{EngineConfig, KeySync, MemoryRemote, StoreConfig};
/// use serde_json::json;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> keysync::Result<()> {
/// let engine = KeySync::new(
///     EngineConfig::new().with_tick_interval(Duration::from_millis(5)),
///     Arc::new(MemoryRemote::new()),
/// );
/// engine.start();
///
/// let store = engine.store(
///     StoreConfig::new("players").with_template_data(json!({"coins": 0})),
/// )?;
///
/// let record = store.open("player-1")?;
/// assert!(record.load().await?);
/// record.update_data(|data| data["coins"] = json!(25))?;
/// record.release(false).await?;
///
/// engine.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct KeySync {
    engine: Arc<Engine>,
    worker: StdMutex<Option<SchedulerWorker>>,
}

impl KeySync {
    /// Build an engine over the given remote store. The scheduler does
    /// not run until [`start`](Self::start) is called.
    pub fn new(config: EngineConfig, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            engine: Arc::new(Engine::new(config, remote)),
            worker: StdMutex::new(None),
        }
    }

    /// Get or create a named store. Idempotent: the first registration's
    /// config wins and later calls return the existing store.
    pub fn store(&self, config: StoreConfig) -> Result<StoreHandle> {
        let store = self.engine.get_or_create_store(config)?;
        Ok(StoreHandle {
            engine: self.engine.clone(),
            store,
        })
    }

    /// Spawn the background scheduler worker. Calling twice replaces the
    /// previous worker.
    pub fn start(&self) {
        let worker = spawn_scheduler_worker(self.engine.clone());
        if let Ok(mut slot) = self.worker.lock() {
            *slot = Some(worker);
        }
    }

    /// Run one scheduler tick inline. Intended for tests and callers that
    /// drive the engine from their own loop instead of [`start`](Self::start).
    pub async fn tick(&self) {
        self.engine.tick().await;
    }

    /// Tear the engine down.
    ///
    /// With `flush_on_shutdown` set, routine queued work is discarded,
    /// every resident record gets an emergency save-and-close pass, and
    /// the call blocks until the queue drains. Otherwise outstanding work
    /// is dropped on the floor.
    pub async fn shutdown(&self) -> Result<()> {
        self.engine.begin_shutdown();

        if self.engine.config.flush_on_shutdown {
            info!("shutdown: flushing resident records");
            self.engine.queue.lock().await.flush_non_emergency();

            // Repeat until every resident record is saved and closed. A
            // record whose routine save is still in flight cannot take an
            // emergency save yet (one outstanding operation per record);
            // once the drain finishes that save, the next pass picks the
            // record up again with its latest payload.
            loop {
                let mut deferred = false;
                let mut saves = Vec::new();

                for store in self.engine.stores_snapshot() {
                    for record in store.resident() {
                        if record.is_closed() {
                            continue;
                        }
                        if !record.has_data() {
                            // Nothing loaded, nothing to save.
                            record.close();
                            continue;
                        }
                        match self.engine.enqueue_update(record.clone(), true).await {
                            Ok(Some(completion)) => saves.push((record, completion)),
                            Ok(None) => deferred = true,
                            Err(SyncError::RecordClosed(_)) => {}
                            Err(err) => return Err(err),
                        }
                    }
                }

                // Block until the emergency saves, and any kept in-flight
                // work, drain.
                loop {
                    if self.engine.queue.lock().await.is_empty() {
                        break;
                    }
                    self.engine.tick().await;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }

                for (record, completion) in saves {
                    completion.wait().await;
                    record.close();
                }

                if !deferred {
                    break;
                }
            }
            info!("shutdown: queue drained");
        } else {
            self.engine.queue.lock().await.emergency_flush();
        }

        let worker = self.worker.lock().map(|mut slot| slot.take()).unwrap_or(None);
        if let Some(worker) = worker {
            worker.stop().await;
        }
        Ok(())
    }

    /// Operability snapshot of engine state.
    pub async fn stats(&self) -> EngineStats {
        let queue_len = self.engine.queue.lock().await.len();
        let stores = self.engine.stores_snapshot();
        EngineStats {
            queue_len,
            store_count: stores.len(),
            resident_records: stores.iter().map(|s| s.resident_count()).sum(),
        }
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub queue_len: usize,
    pub store_count: usize,
    pub resident_records: usize,
}
