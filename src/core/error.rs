use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Record for key '{key}' is already resident in store '{store}'")]
    AlreadyResident { store: String, key: String },

    #[error("Record '{0}' is already loaded")]
    AlreadyLoaded(String),

    #[error("Record '{0}' is not loaded")]
    NotLoaded(String),

    #[error("Record '{0}' is closed")]
    RecordClosed(String),

    #[error("Record '{0}' already has an operation pending")]
    OperationPending(String),

    #[error("User id {0} is already associated with this record")]
    DuplicateUserId(u64),

    #[error("Migration {index} failed: {message}")]
    MigrationFailed { index: usize, message: String },

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
