// ============================================================================
// Remote Store Interface
// ============================================================================

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Budget accounting class for remote requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    Standard,
    Emergency,
}

/// Metadata stored alongside every remote value.
///
/// `session`, `session_started_at` and `data_version` are reserved for the
/// engine; caller-defined fields live in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub session: Option<String>,
    pub session_started_at: i64,
    pub data_version: u32,
    #[serde(default)]
    pub extra: serde_json::Map<String, Value>,
}

/// One remote value: payload, metadata, and associated user ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredValue {
    pub data: Value,
    pub metadata: Metadata,
    pub user_ids: Vec<u64>,
}

/// Outcome of a transform invocation inside a remote transaction.
pub enum Transform {
    /// Commit this value.
    Write(StoredValue),
    /// Commit nothing; the transaction fails without a write.
    Abort,
}

/// Transform closure invoked atomically against the current remote value.
/// May be invoked more than once if the store retries on contention.
pub type TransformFn<'a> = Box<dyn FnMut(Option<StoredValue>) -> Transform + Send + 'a>;

/// Transport-level failure with a structured status code.
///
/// Codes in the 1xx and 4xx families are terminal (malformed request,
/// permission, quota); everything else, including a missing code, is
/// treated as transient and retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub code: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<Option<u16>>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.code, Some(code) if (100..200).contains(&code) || (400..500).contains(&code))
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

/// The remote key-value store collaborator.
///
/// `update` runs the transform atomically against the current value of
/// `(store, key)`: `Transform::Write` commits and returns the committed
/// value, `Transform::Abort` commits nothing and returns `None`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn update(
        &self,
        store: &str,
        key: &str,
        transform: TransformFn<'_>,
    ) -> Result<Option<StoredValue>, RemoteError>;

    /// Remaining request budget for the given class. Backends without a
    /// separate emergency allowance report `i64::MAX` for `Emergency`.
    async fn remaining_budget(&self, class: RequestClass) -> i64;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// In-process `RemoteStore` backed by a `HashMap`.
///
/// The default backend for local use and tests: budget is configurable,
/// and failures can be injected to exercise the retry path.
pub struct MemoryRemote {
    entries: Mutex<HashMap<(String, String), StoredValue>>,
    budget: AtomicI64,
    fail_next: Mutex<VecDeque<RemoteError>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            budget: AtomicI64::new(1_000_000),
            fail_next: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_budget(self, budget: i64) -> Self {
        self.budget.store(budget, Ordering::SeqCst);
        self
    }

    pub fn set_budget(&self, budget: i64) {
        self.budget.store(budget, Ordering::SeqCst);
    }

    /// Queue an error to be returned by the next `update` call instead of
    /// running its transform.
    pub fn inject_failure(&self, error: RemoteError) {
        if let Ok(mut queue) = self.fail_next.lock() {
            queue.push_back(error);
        }
    }

    /// Direct peek at a stored value, bypassing budget accounting.
    pub fn peek(&self, store: &str, key: &str) -> Option<StoredValue> {
        self.entries
            .lock()
            .ok()?
            .get(&(store.to_string(), key.to_string()))
            .cloned()
    }

    /// Number of committed writes remaining before the budget runs dry.
    pub fn budget(&self) -> i64 {
        self.budget.load(Ordering::SeqCst)
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn update(
        &self,
        store: &str,
        key: &str,
        mut transform: TransformFn<'_>,
    ) -> Result<Option<StoredValue>, RemoteError> {
        if let Ok(mut queue) = self.fail_next.lock()
            && let Some(error) = queue.pop_front()
        {
            return Err(error);
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|err| RemoteError::new(None, format!("store lock poisoned: {}", err)))?;

        let slot = (store.to_string(), key.to_string());
        let current = entries.get(&slot).cloned();
        self.budget.fetch_sub(1, Ordering::SeqCst);

        match transform(current) {
            Transform::Write(value) => {
                entries.insert(slot, value.clone());
                Ok(Some(value))
            }
            Transform::Abort => Ok(None),
        }
    }

    async fn remaining_budget(&self, class: RequestClass) -> i64 {
        match class {
            RequestClass::Standard => self.budget.load(Ordering::SeqCst),
            // No separate emergency allowance is modeled.
            RequestClass::Emergency => i64::MAX,
        }
    }
}
