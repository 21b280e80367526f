//! Error types for the tasksync engine.

use thiserror::Error;

/// Errors raised by a local task store implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Store lock poisoned")]
    Poisoned,

    #[error("Store serialization error: {0}")]
    Serialization(String),

    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while synchronizing an account.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    #[error("Server returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Unsupported version {found} (newest supported is {supported})")]
    VersionTooNew { found: u8, supported: u8 },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Transport-class failures that a bounded retry may cure.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport(_) | SyncError::Timeout(_) => true,
            SyncError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The server refused a write because our view of the collection is stale.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict(_))
    }

    /// Errors that must stop the whole account pass instead of a single collection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Unauthorized(_) | SyncError::Cancelled | SyncError::Store(_)
        )
    }
}

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
