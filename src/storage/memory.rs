//! In-memory storage adapters.
//!
//! Both adapters enforce a byte quota and expose fault injection so tests
//! can drive the coordinator through capacity, unavailability and latency
//! failures. Share one instance between several stores (via `Arc`) to model
//! tabs of the same origin.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::RwLock as StdRwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    KeyValueStore, RecordId, RecordMeta, RecordStore, Result, StorageError, StoredRecord, Usage,
};

/// Default fast-store quota, the usual per-origin key/value limit.
pub const DEFAULT_KV_QUOTA: u64 = 5 * 1024 * 1024;
/// Default durable-store quota.
pub const DEFAULT_RECORD_QUOTA: u64 = 50 * 1024 * 1024;

fn poisoned() -> StorageError {
    StorageError::Unavailable("key/value lock poisoned".to_string())
}

/// In-memory bounded key/value store.
pub struct MemoryKeyValueStore {
    entries: StdRwLock<HashMap<String, Vec<u8>>>,
    quota: u64,
    fail_on_write: AtomicBool,
    failing_keys: StdRwLock<HashSet<String>>,
    writes: AtomicU64,
}

impl Default for MemoryKeyValueStore {
    fn default() -> Self {
        Self::with_quota(DEFAULT_KV_QUOTA)
    }
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: u64) -> Self {
        Self {
            entries: StdRwLock::new(HashMap::new()),
            quota,
            fail_on_write: AtomicBool::new(false),
            failing_keys: StdRwLock::new(HashSet::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Make every write fail with `Unavailable`.
    pub fn set_fail_on_write(&self, fail: bool) {
        self.fail_on_write.store(fail, Ordering::SeqCst);
    }

    /// Make writes to one key fail with `CapacityExceeded`.
    pub fn set_fail_key(&self, key: &str, fail: bool) {
        if let Ok(mut keys) = self.failing_keys.write() {
            if fail {
                keys.insert(key.to_string());
            } else {
                keys.remove(key);
            }
        }
    }

    /// Number of successful writes since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn entry_size(key: &str, value: &[u8]) -> u64 {
        (key.len() + value.len()) as u64
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.fail_on_write.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "key/value store rejected write".to_string(),
            ));
        }

        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let used: u64 = entries.iter().map(|(k, v)| Self::entry_size(k, v)).sum();
        let existing = entries
            .get(key)
            .map(|v| Self::entry_size(key, v))
            .unwrap_or(0);
        let needed = used - existing + Self::entry_size(key, value);

        let key_blocked = self
            .failing_keys
            .read()
            .map(|keys| keys.contains(key))
            .unwrap_or(false);
        if key_blocked || needed > self.quota {
            return Err(StorageError::CapacityExceeded {
                needed,
                quota: self.quota,
            });
        }

        entries.insert(key.to_string(), value.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        entries.remove(key);
        Ok(())
    }

    fn estimate_usage(&self) -> Result<Usage> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(Usage {
            used_bytes: entries.iter().map(|(k, v)| Self::entry_size(k, v)).sum(),
            quota_bytes: self.quota,
        })
    }
}

/// In-memory record store with monotonic ids.
pub struct MemoryRecordStore {
    collections: RwLock<HashMap<String, BTreeMap<RecordId, StoredRecord>>>,
    next_id: AtomicU64,
    quota: u64,
    fail_on_open: AtomicBool,
    /// Number of upcoming appends that fail with `Io`.
    failing_appends: AtomicU32,
    latency: RwLock<Option<Duration>>,
    appends: AtomicU64,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::with_quota(DEFAULT_RECORD_QUOTA)
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: u64) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            quota,
            fail_on_open: AtomicBool::new(false),
            failing_appends: AtomicU32::new(0),
            latency: RwLock::new(None),
            appends: AtomicU64::new(0),
        }
    }

    /// Make `open` fail with `Unavailable`.
    pub fn set_fail_on_open(&self, fail: bool) {
        self.fail_on_open.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` appends.
    pub fn fail_next_appends(&self, count: u32) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Delay every append by `latency` (None to disable).
    pub async fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write().await = latency;
    }

    /// Number of successful appends since creation.
    pub fn append_count(&self) -> u64 {
        self.appends.load(Ordering::SeqCst)
    }

    /// Overwrite a record's bytes in place, bypassing id assignment.
    pub async fn overwrite(&self, collection: &str, id: RecordId, bytes: Vec<u8>) {
        let mut collections = self.collections.write().await;
        if let Some(record) = collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(&id))
        {
            record.bytes = bytes;
        }
    }

    /// Change a record's creation instant.
    pub async fn backdate(&self, collection: &str, id: RecordId, created_at: DateTime<Utc>) {
        let mut collections = self.collections.write().await;
        if let Some(record) = collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(&id))
        {
            record.created_at = created_at;
        }
    }

    fn used(collections: &HashMap<String, BTreeMap<RecordId, StoredRecord>>) -> u64 {
        collections
            .values()
            .flat_map(|records| records.values())
            .map(|r| r.bytes.len() as u64)
            .sum()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn open(&self) -> Result<()> {
        if self.fail_on_open.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable(
                "record store denied by platform".to_string(),
            ));
        }
        Ok(())
    }

    async fn append(&self, collection: &str, bytes: Vec<u8>) -> Result<RecordId> {
        if let Some(latency) = *self.latency.read().await {
            tokio::time::sleep(latency).await;
        }

        let failing = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::Io("injected append failure".to_string()));
        }

        let mut collections = self.collections.write().await;
        let needed = Self::used(&collections) + bytes.len() as u64;
        if needed > self.quota {
            return Err(StorageError::CapacityExceeded {
                needed,
                quota: self.quota,
            });
        }

        let id = RecordId(self.next_id.fetch_add(1, Ordering::SeqCst));
        collections.entry(collection.to_string()).or_default().insert(
            id,
            StoredRecord {
                id,
                created_at: Utc::now(),
                bytes,
            },
        );
        self.appends.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn read(&self, collection: &str, id: RecordId) -> Result<Option<StoredRecord>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|records| records.get(&id))
            .cloned())
    }

    async fn list(&self, collection: &str) -> Result<Vec<RecordMeta>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .map(|r| RecordMeta {
                        id: r.id,
                        created_at: r.created_at,
                        size: r.bytes.len() as u64,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn remove(&self, collection: &str, id: RecordId) -> Result<()> {
        let mut collections = self.collections.write().await;
        if let Some(records) = collections.get_mut(collection) {
            records.remove(&id);
        }
        Ok(())
    }

    async fn estimate_usage(&self) -> Result<Usage> {
        let collections = self.collections.read().await;
        Ok(Usage {
            used_bytes: Self::used(&collections),
            quota_bytes: self.quota,
        })
    }
}
