//! Backend I/O of a single save. Everything here assumes the write lock
//! is held by the caller unless noted.

use std::future::Future;
use std::sync::atomic::Ordering;

use backon::BackoffBuilder;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{Inner, QuarantineRecord, SaveOutcome, SaveRequest, SaveStatus};
use crate::checksum;
use crate::error::{Result, StoreError};
use crate::events::StoreEvent;
use crate::migrate::CURRENT_SCHEMA_VERSION;
use crate::model::{HeadPointer, SnapshotLocation};
use crate::storage::{
    self, RecordId, StorageError, HEAD_KEY, LAST_CLEANUP_KEY, QUARANTINE_COLLECTION,
    QUARANTINE_KEY, SNAPSHOT_COLLECTION, SNAPSHOT_KEY,
};
use crate::utils::retry::durable_write_backoff;

/// Result of checking a head pointer against the snapshot it names.
pub(super) enum HeadCheck {
    /// Snapshot found and its checksum matches the head.
    Valid(Value),
    /// Snapshot missing, self-inconsistent, or not the one the head names.
    Corrupt {
        bytes: Option<Vec<u8>>,
        reason: String,
    },
    /// Snapshot lives in a backend that is not available this session.
    Unverifiable,
}

impl Inner {
    pub(super) async fn perform_save(&self, request: &SaveRequest) -> Result<SaveOutcome> {
        let previous = self.read_head()?;
        if let Some(head) = &previous {
            if let HeadCheck::Corrupt { bytes, reason } = self.verify_head(head).await? {
                warn!(%reason, "Existing snapshot failed verification before overwrite");
                self.quarantine(Some(head), bytes, &reason).await?;
            }
        }

        let mut snapshot = self.migrator.migrate(request.snapshot.clone())?;
        snapshot.schema_version = CURRENT_SCHEMA_VERSION;
        snapshot.last_updated = Some(Utc::now());
        snapshot.checksum = checksum::checksum(&snapshot);
        let bytes =
            serde_json::to_vec(&snapshot).map_err(|e| StoreError::Storage(e.to_string()))?;

        let location = self.write_snapshot(bytes).await?;
        let revision = self.next_revision(previous.as_ref());
        let head = HeadPointer {
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: snapshot.checksum.clone(),
            location,
            revision,
            written_at: Utc::now(),
        };

        let head_stale = match self.write_head(&head) {
            Ok(()) => false,
            Err(e) => {
                warn!(error = %e, revision, "Snapshot stored but head pointer not updated");
                self.events
                    .emit(StoreEvent::HeadWriteFailed {
                        reason: e.to_string(),
                    })
                    .await;
                true
            }
        };

        Ok(SaveOutcome {
            status: SaveStatus::Committed,
            sequence: request.sequence,
            revision: Some(revision),
            head_stale,
        })
    }

    /// Bound a durable-store call by the configured timeout.
    ///
    /// Safe without the write lock.
    pub(super) async fn durable_call<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = storage::Result<T>>,
    {
        let limit = self.config.durable_timeout();
        match tokio::time::timeout(limit, op).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(limit.as_millis() as u64)),
        }
    }

    /// Read the head pointer. Unparseable heads read as absent.
    ///
    /// Safe without the write lock.
    pub(super) fn read_head(&self) -> Result<Option<HeadPointer>> {
        let Some(bytes) = self.fast.read(HEAD_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(head) => Ok(Some(head)),
            Err(e) => {
                debug!(error = %e, "Head pointer unreadable");
                Ok(None)
            }
        }
    }

    pub(super) fn write_head(&self, head: &HeadPointer) -> Result<()> {
        let bytes = serde_json::to_vec(head).map_err(|e| StoreError::Storage(e.to_string()))?;
        self.fast.write(HEAD_KEY, &bytes)?;
        Ok(())
    }

    /// Check that the snapshot a head names exists and carries its checksum.
    ///
    /// Safe without the write lock.
    pub(super) async fn verify_head(&self, head: &HeadPointer) -> Result<HeadCheck> {
        let bytes = match head.location {
            SnapshotLocation::Durable { id } => {
                if !self.is_durable_available() {
                    return Ok(HeadCheck::Unverifiable);
                }
                match self
                    .durable_call(self.durable.read(SNAPSHOT_COLLECTION, id))
                    .await?
                {
                    Some(record) => record.bytes,
                    None => {
                        return Ok(HeadCheck::Corrupt {
                            bytes: None,
                            reason: format!("snapshot {} named by head is missing", id),
                        })
                    }
                }
            }
            SnapshotLocation::Fast => match self.fast.read(SNAPSHOT_KEY)? {
                Some(bytes) => bytes,
                None => {
                    return Ok(HeadCheck::Corrupt {
                        bytes: None,
                        reason: "fast-store snapshot named by head is missing".to_string(),
                    })
                }
            },
        };

        match checksum::verified_value(&bytes) {
            Some(value)
                if value.get("checksum").and_then(Value::as_str) == Some(head.checksum.as_str()) =>
            {
                Ok(HeadCheck::Valid(value))
            }
            Some(_) => Ok(HeadCheck::Corrupt {
                bytes: Some(bytes),
                reason: format!("head checksum {} does not match snapshot", head.checksum),
            }),
            None => Ok(HeadCheck::Corrupt {
                bytes: Some(bytes),
                reason: "snapshot fails its own checksum".to_string(),
            }),
        }
    }

    /// Store the snapshot body: durable store first, fast store when degraded.
    async fn write_snapshot(&self, bytes: Vec<u8>) -> Result<SnapshotLocation> {
        if self.is_durable_available() {
            match self.append_with_retry(&bytes).await {
                Ok(id) => return Ok(SnapshotLocation::Durable { id }),
                Err(StoreError::Unavailable(reason)) => self.enter_degraded(&reason).await,
                Err(e) => return Err(e),
            }
        }
        self.write_fast_snapshot(&bytes)?;
        Ok(SnapshotLocation::Fast)
    }

    /// Fast-store snapshot write for degraded mode. A capacity failure
    /// drops disposable maintenance keys and retries once; the quarantine
    /// copy is never dropped.
    fn write_fast_snapshot(&self, bytes: &[u8]) -> Result<()> {
        match self.fast.write(SNAPSHOT_KEY, bytes) {
            Err(StorageError::CapacityExceeded { needed, quota }) => {
                warn!(needed, quota, "Fast store full, freeing space before retry");
                self.fast.remove(LAST_CLEANUP_KEY)?;
                self.fast.write(SNAPSHOT_KEY, bytes)?;
                Ok(())
            }
            result => result.map_err(StoreError::from),
        }
    }

    /// Append with one retry for transient failures. Capacity failures
    /// prune old snapshots before the retry.
    async fn append_with_retry(&self, bytes: &[u8]) -> Result<RecordId> {
        let mut backoff = durable_write_backoff(self.config.durable_retry_delay()).build();
        loop {
            let attempt = self
                .durable_call(self.durable.append(SNAPSHOT_COLLECTION, bytes.to_vec()))
                .await;
            match attempt {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() => {
                    let Some(delay) = backoff.next() else {
                        return Err(e);
                    };
                    warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Durable write failed, retrying"
                    );
                    if matches!(e, StoreError::CapacityExceeded { .. }) {
                        match self.prune_snapshots(None).await {
                            Ok(removed) => debug!(removed, "Pruned snapshots to free space"),
                            Err(e) => warn!(error = %e, "Pruning before retry failed"),
                        }
                    }
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn next_revision(&self, previous: Option<&HeadPointer>) -> u64 {
        let floor = previous.map(|h| h.revision).unwrap_or_default();
        let revision = self.revision.load(Ordering::SeqCst).max(floor) + 1;
        self.revision.store(revision, Ordering::SeqCst);
        revision
    }

    /// Preserve rejected data before anything overwrites it.
    ///
    /// Goes to the fast quarantine key, falling back to the durable
    /// quarantine collection. Fails with `CorruptionDetected` when neither
    /// can hold it. Emits [`StoreEvent::CorruptionDetected`] either way.
    pub(super) async fn quarantine(
        &self,
        head: Option<&HeadPointer>,
        bytes: Option<Vec<u8>>,
        reason: &str,
    ) -> Result<()> {
        self.stats.corruptions.fetch_add(1, Ordering::SeqCst);
        self.corruption_seen.store(true, Ordering::SeqCst);

        let record = QuarantineRecord {
            quarantined_at: Utc::now(),
            reason: reason.to_string(),
            head: head.cloned(),
            payload_hex: bytes.as_deref().map(hex::encode),
        };
        let result = match serde_json::to_vec(&record) {
            Ok(encoded) => self.store_quarantine(encoded).await,
            Err(e) => Err(StoreError::CorruptionDetected(format!(
                "{}; quarantine not encodable: {}",
                reason, e
            ))),
        };

        if let Err(e) = &result {
            error!(error = %e, "Corrupt data could not be quarantined");
        }
        self.events
            .emit(StoreEvent::CorruptionDetected {
                reason: reason.to_string(),
                quarantined: result.is_ok(),
            })
            .await;
        result
    }

    async fn store_quarantine(&self, encoded: Vec<u8>) -> Result<()> {
        let fast_error = match self.fast.write(QUARANTINE_KEY, &encoded) {
            Ok(()) => {
                debug!(bytes = encoded.len(), "Quarantined to fast store");
                return Ok(());
            }
            Err(e) => e,
        };
        warn!(error = %fast_error, "Fast quarantine failed, using durable store");

        if !self.is_durable_available() {
            return Err(StoreError::CorruptionDetected(format!(
                "quarantine rejected by fast store: {}",
                fast_error
            )));
        }

        let replace = async {
            for meta in self
                .durable_call(self.durable.list(QUARANTINE_COLLECTION))
                .await?
            {
                self.durable_call(self.durable.remove(QUARANTINE_COLLECTION, meta.id))
                    .await?;
            }
            self.durable_call(self.durable.append(QUARANTINE_COLLECTION, encoded))
                .await
        };
        match replace.await {
            Ok(id) => {
                debug!(record_id = %id, "Quarantined to durable store");
                Ok(())
            }
            Err(e) => Err(StoreError::CorruptionDetected(format!(
                "quarantine rejected by both stores: {}",
                e
            ))),
        }
    }

    /// Switch to fast-only storage for the rest of the session.
    ///
    /// Safe without the write lock.
    pub(super) async fn enter_degraded(&self, reason: &str) {
        if self.durable_available.swap(false, Ordering::SeqCst) {
            warn!(%reason, "Durable store unavailable, continuing in degraded mode");
            self.events
                .emit(StoreEvent::Degraded {
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    /// Remove snapshot records created before `older_than` (all of them
    /// when `None`), keeping the one the head names and the newest.
    pub(super) async fn prune_snapshots(&self, older_than: Option<DateTime<Utc>>) -> Result<usize> {
        if !self.is_durable_available() {
            return Ok(0);
        }

        let records = self
            .durable_call(self.durable.list(SNAPSHOT_COLLECTION))
            .await?;
        let newest = records.last().map(|r| r.id);
        let head_id = match self.read_head() {
            Ok(Some(HeadPointer {
                location: SnapshotLocation::Durable { id },
                ..
            })) => Some(id),
            _ => None,
        };

        let mut removed = 0;
        for record in &records {
            if Some(record.id) == newest || Some(record.id) == head_id {
                continue;
            }
            if older_than.is_some_and(|cutoff| record.created_at >= cutoff) {
                continue;
            }
            self.durable_call(self.durable.remove(SNAPSHOT_COLLECTION, record.id))
                .await?;
            removed += 1;
        }
        Ok(removed)
    }
}
