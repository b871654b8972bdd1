//! Public error taxonomy of the progress store.

use crate::migrate::MigrationError;
use crate::storage::StorageError;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the coordinator and facade.
///
/// `Clone` so one failure can be delivered to every queued request it
/// rejects.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    /// Backend cannot be used for the rest of the session.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Write rejected for size, still failing after cleanup.
    #[error("Storage capacity exceeded: needed {needed} bytes, quota {quota} bytes")]
    CapacityExceeded { needed: u64, quota: u64 },

    /// Stored data failed checksum verification and could not be preserved.
    #[error("Corruption detected: {0}")]
    CorruptionDetected(String),

    /// Persisted snapshot cannot be brought to the current schema.
    #[error("Migration failed: {0}")]
    MigrationFailed(#[from] MigrationError),

    /// A durable-store call exceeded its time bound.
    #[error("Storage operation timed out after {0}ms")]
    Timeout(u64),

    /// Any other backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The store was closed.
    #[error("Progress store is closed")]
    Closed,
}

impl StoreError {
    /// Failures worth exactly one automatic retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Timeout(_) | StoreError::CapacityExceeded { .. } | StoreError::Storage(_)
        )
    }
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Unavailable(reason) => StoreError::Unavailable(reason),
            StorageError::CapacityExceeded { needed, quota } => {
                StoreError::CapacityExceeded { needed, quota }
            }
            other => StoreError::Storage(other.to_string()),
        }
    }
}
