// ============================================================================
// Record Lifecycle
// ============================================================================

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::warn;

use crate::checksum::checksum;
use crate::core::{Result, SyncError};
use crate::engine::Engine;
use crate::notify::Completion;
use crate::remote::{Metadata, StoredValue};
use crate::session::{SessionId, session_now_ms};
use crate::store::Store;

/// In-memory handle state for one remote key.
///
/// Lifecycle: Unloaded → Loading → Loaded → Closed. Closed is terminal and
/// reachable from any state (force close without save).
pub(crate) struct Record {
    key: String,
    store: Arc<Store>,
    session_id: SessionId,
    session_started_at: i64,
    state: Mutex<RecordState>,
    closed_signal: Completion,
}

struct RecordState {
    data: Option<Value>,
    metadata: Option<Metadata>,
    user_ids: Vec<u64>,
    loaded: bool,
    closed: bool,
    last_checksum: Option<u64>,
    last_processed_at: Option<Instant>,
}

impl Record {
    /// Create the record and register it as resident in its store.
    pub(crate) fn open(store: Arc<Store>, key: &str) -> Result<Arc<Self>> {
        let record = Arc::new(Self {
            key: key.to_string(),
            store: store.clone(),
            session_id: SessionId::generate(),
            session_started_at: session_now_ms(),
            state: Mutex::new(RecordState {
                data: None,
                metadata: None,
                user_ids: Vec::new(),
                loaded: false,
                closed: false,
                last_checksum: None,
                last_processed_at: None,
            }),
            closed_signal: Completion::new(),
        });
        store.insert_record(key, record.clone())?;
        Ok(record)
    }

    fn state(&self) -> Result<MutexGuard<'_, RecordState>> {
        self.state.lock().map_err(Into::into)
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn store_ref(&self) -> &Arc<Store> {
        &self.store
    }

    pub(crate) fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub(crate) fn session_started_at(&self) -> i64 {
        self.session_started_at
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.state.lock().map(|s| s.loaded).unwrap_or(false)
    }

    pub(crate) fn mark_loaded(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.loaded = true;
        }
    }

    pub(crate) fn has_data(&self) -> bool {
        self.state.lock().map(|s| s.data.is_some()).unwrap_or(false)
    }

    /// Idempotent terminal transition: mark closed, leave the store's
    /// resident set, fire the closed signal. Safe to call repeatedly.
    pub(crate) fn close(self: &Arc<Self>) {
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.store.remove_record(&self.key, self);
        self.closed_signal.resolve(true);
    }

    pub(crate) fn closed_signal(&self) -> &Completion {
        &self.closed_signal
    }

    /// Local state seen by the transaction executor: cached payload (None
    /// until first load) and associated user ids.
    pub(crate) fn local_snapshot(&self) -> (Option<Value>, Vec<u64>) {
        match self.state.lock() {
            Ok(state) => (state.data.clone(), state.user_ids.clone()),
            Err(_) => (None, Vec::new()),
        }
    }

    /// Adopt a remote value after a successful load (or post-conflict
    /// reload): payload, metadata and user ids all come from the store.
    pub(crate) fn adopt_loaded(&self, value: StoredValue) {
        if let Ok(mut state) = self.state.lock() {
            state.data = Some(value.data);
            state.metadata = Some(value.metadata);
            state.user_ids = value.user_ids;
        }
    }

    /// After a successful save only the bookkeeping comes back; the local
    /// payload stays authoritative.
    pub(crate) fn adopt_saved(&self, metadata: Metadata, user_ids: Vec<u64>) {
        if let Ok(mut state) = self.state.lock() {
            state.metadata = Some(metadata);
            state.user_ids = user_ids;
        }
    }

    pub(crate) fn mark_processed_now(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.last_processed_at = Some(Instant::now());
        }
    }

    /// Reset the dirty-detection baseline to the current payload.
    pub(crate) fn refresh_checksum(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.last_checksum = state.data.as_ref().map(checksum);
        }
    }

    /// Auto-save candidate check: returns the current payload and stored
    /// baseline when the record is open, has data, and its quiet period
    /// has elapsed.
    pub(crate) fn auto_save_candidate(&self, interval: Duration) -> Option<(Value, Option<u64>)> {
        let state = self.state.lock().ok()?;
        if state.closed {
            return None;
        }
        let data = state.data.as_ref()?;
        let processed_at = state.last_processed_at?;
        if processed_at.elapsed() < interval {
            return None;
        }
        Some((data.clone(), state.last_checksum))
    }

    /// Stamp a new dirty baseline ahead of an auto-save enqueue.
    pub(crate) fn stamp_auto_save(&self, new_checksum: u64) {
        if let Ok(mut state) = self.state.lock() {
            state.last_checksum = Some(new_checksum);
            state.last_processed_at = Some(Instant::now());
        }
    }
}

/// Public handle to one resident record.
#[derive(Clone)]
pub struct RecordHandle {
    pub(crate) engine: Arc<Engine>,
    pub(crate) record: Arc<Record>,
}

impl RecordHandle {
    pub fn key(&self) -> &str {
        self.record.key()
    }

    pub fn session_id(&self) -> SessionId {
        self.record.session_id()
    }

    /// UTC millisecond timestamp at which this record's session began.
    pub fn session_started_at(&self) -> i64 {
        self.record.session_started_at()
    }

    pub fn is_loaded(&self) -> bool {
        self.record.is_loaded()
    }

    pub fn is_closed(&self) -> bool {
        self.record.is_closed()
    }

    /// Fetch the record from the remote store and block until the
    /// operation resolves. Returns whether the load succeeded; a failed
    /// load force-closes the record.
    ///
    /// If an operation is already pending for this record the call fails
    /// with `OperationPending` rather than handing back the in-flight
    /// notifier; the first caller holds the only handle to it.
    pub async fn load(&self) -> Result<bool> {
        {
            let record = &self.record;
            if record.is_closed() {
                return Err(SyncError::RecordClosed(record.key().to_string()));
            }
            if record.is_loaded() {
                return Err(SyncError::AlreadyLoaded(record.key().to_string()));
            }
        }
        let completion = self
            .engine
            .enqueue_update(self.record.clone(), false)
            .await?
            .ok_or_else(|| SyncError::OperationPending(self.record.key().to_string()))?;

        let success = completion.wait().await;
        if success {
            self.record.mark_loaded();
        }
        Ok(success)
    }

    /// Queue a save of the current in-memory payload. Returns `None` when
    /// an operation is already pending for this record (the earlier
    /// caller holds its notifier). A failing operation force-closes the
    /// record.
    pub async fn update(&self, emergency: bool) -> Result<Option<Completion>> {
        if self.record.is_closed() {
            return Err(SyncError::RecordClosed(self.record.key().to_string()));
        }
        self.engine.enqueue_update(self.record.clone(), emergency).await
    }

    /// Save and close. An unloaded record is force-closed without a
    /// remote call (there is nothing to save). The record is closed
    /// whether or not the final save succeeds.
    pub async fn release(&self, emergency: bool) -> Result<bool> {
        if self.record.is_closed() {
            return Err(SyncError::RecordClosed(self.record.key().to_string()));
        }
        if !self.record.is_loaded() {
            self.record.close();
            return Ok(true);
        }
        match self.engine.enqueue_update(self.record.clone(), emergency).await? {
            Some(completion) => {
                let success = completion.wait().await;
                self.record.close();
                Ok(success)
            }
            None => {
                // An earlier operation is still pending and cannot be
                // awaited from here; close and report failure.
                warn!(key = %self.record.key(), "release with an operation pending; closing without final save");
                self.record.close();
                Ok(false)
            }
        }
    }

    /// Force-close without saving. Idempotent.
    pub fn close(&self) {
        self.record.close();
    }

    /// Signal resolved once the record reaches its closed state.
    pub fn closed(&self) -> Completion {
        self.record.closed_signal().clone()
    }

    /// Associate a user id with this record. Takes effect remotely on the
    /// next write.
    pub fn add_user_id(&self, id: u64) -> Result<()> {
        let mut state = self.record.state()?;
        if state.closed {
            return Err(SyncError::RecordClosed(self.record.key().to_string()));
        }
        if state.user_ids.contains(&id) {
            return Err(SyncError::DuplicateUserId(id));
        }
        state.user_ids.push(id);
        Ok(())
    }

    pub fn user_ids(&self) -> Vec<u64> {
        self.record
            .state
            .lock()
            .map(|s| s.user_ids.clone())
            .unwrap_or_default()
    }

    /// Clone of the cached payload; `None` before the first load.
    pub fn data(&self) -> Option<Value> {
        self.record.state.lock().ok().and_then(|s| s.data.clone())
    }

    pub fn metadata(&self) -> Option<Metadata> {
        self.record
            .state
            .lock()
            .ok()
            .and_then(|s| s.metadata.clone())
    }

    /// Mutate the cached payload in place. The change reaches the remote
    /// store on the next save (explicit update, auto-save, or release).
    pub fn update_data<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Value),
    {
        let mut state = self.record.state()?;
        if state.closed {
            return Err(SyncError::RecordClosed(self.record.key().to_string()));
        }
        match state.data.as_mut() {
            Some(data) => {
                f(data);
                Ok(())
            }
            None => Err(SyncError::NotLoaded(self.record.key().to_string())),
        }
    }
}
