//! Directory-backed storage adapters.
//!
//! Layout:
//! ```text
//! {data_dir}/
//!   kv/
//!     {hex(key)}.kv
//!   records/
//!     {collection}/
//!       {id:020}.rec
//! ```
//!
//! Writes go to a temp file first and are moved into place, so a reader
//! never sees a half-written value. Records are hard-linked under a new id
//! rather than renamed, so stores sharing a directory never overwrite each
//! other's records.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    KeyValueStore, RecordId, RecordMeta, RecordStore, Result, StorageError, StoredRecord, Usage,
};

const KV_EXTENSION: &str = "kv";
const RECORD_EXTENSION: &str = "rec";

/// Key/value store with one file per key.
pub struct FileKeyValueStore {
    base_path: PathBuf,
    quota: u64,
}

impl FileKeyValueStore {
    /// Create the store, creating the base directory if needed.
    pub fn new(base_path: impl AsRef<Path>, quota: u64) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)
            .map_err(|e| StorageError::Unavailable(format!("{}: {}", base_path.display(), e)))?;
        Ok(Self { base_path, quota })
    }

    fn path_for_key(&self, key: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.{}", hex::encode(key), KV_EXTENSION))
    }

    fn file_size(path: &Path) -> u64 {
        std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }

    fn used(&self) -> Result<u64> {
        let mut used = 0;
        for entry in std::fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == KV_EXTENSION) {
                used += Self::file_size(&path);
            }
        }
        Ok(used)
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for_key(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for_key(key);
        let needed = self.used()? - Self::file_size(&path) + value.len() as u64;
        if needed > self.quota {
            return Err(StorageError::CapacityExceeded {
                needed,
                quota: self.quota,
            });
        }

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, value)?;
        std::fs::rename(&temp_path, &path)?;
        debug!(key, size = value.len(), "Wrote key");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for_key(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn estimate_usage(&self) -> Result<Usage> {
        Ok(Usage {
            used_bytes: self.used()?,
            quota_bytes: self.quota,
        })
    }
}

/// Record store with one directory per collection and one file per record.
///
/// Record creation time is the file's modification time.
pub struct FileRecordStore {
    base_path: PathBuf,
    quota: u64,
    opened: AtomicBool,
    next_id: AtomicU64,
}

impl FileRecordStore {
    /// Create an unopened store. Call [`RecordStore::open`] before use.
    pub fn new(base_path: impl AsRef<Path>, quota: u64) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            quota,
            opened: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::Unavailable("record store not opened".to_string()))
        }
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.base_path.join(collection)
    }

    fn record_path(&self, collection: &str, id: RecordId) -> PathBuf {
        self.collection_path(collection)
            .join(format!("{}.{}", id, RECORD_EXTENSION))
    }

    fn parse_id(path: &Path) -> Option<RecordId> {
        if path.extension().is_none_or(|e| e != RECORD_EXTENSION) {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok().map(RecordId)
    }

    /// Highest record id present in one collection directory.
    async fn max_id_in(&self, collection: &str) -> Result<u64> {
        let mut entries = match fs::read_dir(self.collection_path(collection)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut max_id = 0;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = Self::parse_id(&entry.path()) {
                max_id = max_id.max(id.0);
            }
        }
        Ok(max_id)
    }

    /// Link a fully written temp file to the next free record id.
    ///
    /// The hard link fails on an existing name, so another store sharing
    /// the directory can never have its record replaced. Ids stay above
    /// every record already present in the collection.
    async fn claim_id(&self, collection: &str, temp_path: &Path) -> Result<RecordId> {
        let floor = self.max_id_in(collection).await? + 1;
        let mut candidate = self.next_id.load(Ordering::SeqCst).max(floor);
        loop {
            let id = RecordId(candidate);
            match fs::hard_link(temp_path, self.record_path(collection, id)).await {
                Ok(()) => {
                    self.next_id.fetch_max(candidate + 1, Ordering::SeqCst);
                    return Ok(id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    debug!(collection, record_id = %id, "Record id taken, trying next");
                    candidate += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Walk every collection directory, calling `visit` per record file.
    async fn walk<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(RecordId, &std::fs::Metadata),
    {
        let mut collections = fs::read_dir(&self.base_path).await?;
        while let Some(collection) = collections.next_entry().await? {
            let path = collection.path();
            if !path.is_dir() {
                continue;
            }
            let mut records = fs::read_dir(&path).await?;
            while let Some(record) = records.next_entry().await? {
                let record_path = record.path();
                if let Some(id) = Self::parse_id(&record_path) {
                    let metadata = fs::metadata(&record_path).await?;
                    visit(id, &metadata);
                }
            }
        }
        Ok(())
    }

    fn modified_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
        metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now())
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn open(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).await.map_err(|e| {
            StorageError::Unavailable(format!("{}: {}", self.base_path.display(), e))
        })?;

        let mut max_id = 0;
        self.walk(|id, _| max_id = max_id.max(id.0)).await?;
        self.next_id.store(max_id + 1, Ordering::SeqCst);
        self.opened.store(true, Ordering::SeqCst);

        info!(
            path = %self.base_path.display(),
            next_id = max_id + 1,
            "Record store opened"
        );
        Ok(())
    }

    async fn append(&self, collection: &str, bytes: Vec<u8>) -> Result<RecordId> {
        self.ensure_open()?;

        let needed = self.estimate_usage().await?.used_bytes + bytes.len() as u64;
        if needed > self.quota {
            return Err(StorageError::CapacityExceeded {
                needed,
                quota: self.quota,
            });
        }

        let dir = self.collection_path(collection);
        fs::create_dir_all(&dir).await?;
        let temp_path = dir.join(format!("{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &bytes).await?;

        let claimed = self.claim_id(collection, &temp_path).await;
        if let Err(e) = fs::remove_file(&temp_path).await {
            warn!(path = %temp_path.display(), error = %e, "Failed to remove temp record");
        }
        let id = claimed?;

        debug!(collection, record_id = %id, size = bytes.len(), "Appended record");
        Ok(id)
    }

    async fn read(&self, collection: &str, id: RecordId) -> Result<Option<StoredRecord>> {
        self.ensure_open()?;

        let path = self.record_path(collection, id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let metadata = fs::metadata(&path).await?;

        Ok(Some(StoredRecord {
            id,
            created_at: Self::modified_at(&metadata),
            bytes,
        }))
    }

    async fn list(&self, collection: &str) -> Result<Vec<RecordMeta>> {
        self.ensure_open()?;

        let dir = self.collection_path(collection);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut metas = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(id) = Self::parse_id(&path) else {
                continue;
            };
            match fs::metadata(&path).await {
                Ok(metadata) => metas.push(RecordMeta {
                    id,
                    created_at: Self::modified_at(&metadata),
                    size: metadata.len(),
                }),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable record");
                }
            }
        }
        metas.sort_by_key(|m| m.id);
        Ok(metas)
    }

    async fn remove(&self, collection: &str, id: RecordId) -> Result<()> {
        self.ensure_open()?;

        match fs::remove_file(self.record_path(collection, id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn estimate_usage(&self) -> Result<Usage> {
        self.ensure_open()?;

        let mut used = 0;
        self.walk(|_, metadata| used += metadata.len()).await?;
        Ok(Usage {
            used_bytes: used,
            quota_bytes: self.quota,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unopened_store_is_unavailable() {
        let temp = TempDir::new().unwrap();
        let store = FileRecordStore::new(temp.path().join("records"), 1024);
        let result = store.append("snapshots", b"x".to_vec()).await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_open_fails_when_path_is_a_file() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("records");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let store = FileRecordStore::new(&blocker, 1024);
        assert!(matches!(
            store.open().await,
            Err(StorageError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_ids_continue_after_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("records");

        let store = FileRecordStore::new(&path, 1024 * 1024);
        store.open().await.unwrap();
        let first = store.append("snapshots", b"one".to_vec()).await.unwrap();
        drop(store);

        let reopened = FileRecordStore::new(&path, 1024 * 1024);
        reopened.open().await.unwrap();
        let second = reopened.append("snapshots", b"two".to_vec()).await.unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_kv_keys_map_to_distinct_files() {
        let temp = TempDir::new().unwrap();
        let store = FileKeyValueStore::new(temp.path(), 1024).unwrap();
        assert_ne!(
            store.path_for_key("progress:head"),
            store.path_for_key("progress:snapshot")
        );
    }

    #[test]
    fn test_kv_capacity_counts_replaced_value_once() {
        let temp = TempDir::new().unwrap();
        let store = FileKeyValueStore::new(temp.path(), 10).unwrap();
        store.write("k", b"0123456789").unwrap();
        store.write("k", b"abcdefghij").unwrap();
        assert!(matches!(
            store.write("other", b"x"),
            Err(StorageError::CapacityExceeded { .. })
        ));
    }
}
