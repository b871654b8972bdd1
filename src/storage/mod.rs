//! Storage backends.
//!
//! Two adapter shapes share one capability set (read, write, remove,
//! estimate usage):
//!
//! - [`KeyValueStore`]: synchronous, small and capacity-bounded. Holds the
//!   head pointer and other hot keys.
//! - [`RecordStore`]: asynchronous, larger, organised in named collections of
//!   records with monotonically increasing ids. Holds full snapshots.
//!
//! Implementations:
//! - `MemoryKeyValueStore` / `MemoryRecordStore`: in-memory, with quota and
//!   fault injection
//! - `FileKeyValueStore` / `FileRecordStore`: directory-backed

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::StoreConfig;

pub mod filesystem;
pub mod memory;

pub use filesystem::{FileKeyValueStore, FileRecordStore};
pub use memory::{MemoryKeyValueStore, MemoryRecordStore};

/// Fast-store key of the head pointer.
pub const HEAD_KEY: &str = "progress:head";
/// Fast-store key of the full snapshot in degraded mode.
pub const SNAPSHOT_KEY: &str = "progress:snapshot";
/// Fast-store key of the quarantined (checksum-invalid) snapshot.
pub const QUARANTINE_KEY: &str = "progress:quarantine";
/// Fast-store key holding the RFC 3339 instant of the last cleanup run.
pub const LAST_CLEANUP_KEY: &str = "progress:last-cleanup";

/// Durable collection of full snapshots.
pub const SNAPSHOT_COLLECTION: &str = "snapshots";
/// Durable collection used for quarantine when the fast store is full.
pub const QUARANTINE_COLLECTION: &str = "quarantine";

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors raised by storage adapters.
///
/// Capacity errors are distinct from unavailability so callers can clean up
/// in one case and degrade in the other.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Capacity exceeded: needed {needed} bytes, quota {quota} bytes")]
    CapacityExceeded { needed: u64, quota: u64 },

    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: RecordId },

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

/// Monotonic identifier of a durable record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:020}", self.0)
    }
}

/// Bytes used against the adapter's quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
}

impl Usage {
    /// Fraction of quota in use, 0.0 when the quota is unknown.
    pub fn ratio(&self) -> f64 {
        if self.quota_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.quota_bytes as f64
        }
    }
}

/// A record read back from a [`RecordStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

/// Listing entry for a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordMeta {
    pub id: RecordId,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

/// Synchronous, capacity-bounded key/value adapter.
pub trait KeyValueStore: Send + Sync {
    /// Read a key. Returns `None` if it does not exist.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a key, replacing any previous value.
    ///
    /// Fails with `CapacityExceeded` when the new value would push usage
    /// past the quota.
    fn write(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Current usage against quota.
    fn estimate_usage(&self) -> Result<Usage>;
}

/// Asynchronous adapter over named collections of versioned records.
///
/// Record ids are assigned by the store and strictly increase across all
/// collections, so a later write always has a larger id.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Prepare the backing store.
    ///
    /// Failure is permanent for the session: callers switch to degraded
    /// mode instead of retrying.
    async fn open(&self) -> Result<()>;

    /// Append a record and return its id.
    async fn append(&self, collection: &str, bytes: Vec<u8>) -> Result<RecordId>;

    /// Read a record by id. Returns `None` if it does not exist.
    async fn read(&self, collection: &str, id: RecordId) -> Result<Option<StoredRecord>>;

    /// List records in a collection ordered by ascending id.
    async fn list(&self, collection: &str) -> Result<Vec<RecordMeta>>;

    /// Remove a record. Removing a missing record is not an error.
    async fn remove(&self, collection: &str, id: RecordId) -> Result<()>;

    /// Current usage against quota.
    async fn estimate_usage(&self) -> Result<Usage>;
}

/// Initialize directory-backed adapters under the configured data dir.
///
/// Returns `(fast, durable)`. The durable store is not opened here; the
/// coordinator opens it and degrades when that fails.
pub fn init_storage(config: &StoreConfig) -> Result<(Arc<dyn KeyValueStore>, Arc<dyn RecordStore>)> {
    info!(data_dir = %config.data_dir.display(), "Storage: filesystem");

    let fast = FileKeyValueStore::new(config.data_dir.join("kv"), config.fast_quota_bytes)?;
    let durable = FileRecordStore::new(config.data_dir.join("records"), config.durable_quota_bytes);

    Ok((Arc::new(fast), Arc::new(durable)))
}
