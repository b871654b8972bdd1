//! Read path, corruption recovery, retention cleanup and quota checks.

use std::sync::atomic::Ordering;

use backon::BackoffBuilder;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::persist::HeadCheck;
use super::{Inner, QuarantineRecord, QuotaReport, WritePhase};
use crate::checksum;
use crate::error::{Result, StoreError};
use crate::events::StoreEvent;
use crate::model::{HeadPointer, ProgressSnapshot, SnapshotLocation};
use crate::storage::{
    RecordId, Usage, HEAD_KEY, LAST_CLEANUP_KEY, QUARANTINE_COLLECTION, QUARANTINE_KEY,
    SNAPSHOT_COLLECTION, SNAPSHOT_KEY,
};
use crate::utils::retry::head_reread_backoff;

/// A verified snapshot found by scanning, and where it lives.
struct Recovered {
    value: Value,
    location: SnapshotLocation,
}

impl Inner {
    /// Read without the write lock, retrying a head that disagrees with
    /// its snapshot in case a write is mid-flight. Persistent disagreement
    /// is settled under the lock.
    pub(super) async fn load(&self) -> Result<ProgressSnapshot> {
        let mut backoff = head_reread_backoff(self.config.head_read_retries).build();
        loop {
            let Some(head) = self.read_head()? else {
                break;
            };
            match self.verify_head(&head).await? {
                HeadCheck::Valid(value) => {
                    if self.newer_than_head(&head).await?.is_none() {
                        return self.finish_load(value, true).await;
                    }
                    debug!(revision = head.revision, "Head is behind the newest snapshot");
                    break;
                }
                HeadCheck::Unverifiable => break,
                HeadCheck::Corrupt { reason, .. } => match backoff.next() {
                    Some(delay) => {
                        debug!(%reason, delay_ms = delay.as_millis() as u64, "Head mismatch, re-reading");
                        tokio::time::sleep(delay).await;
                    }
                    None => break,
                },
            }
        }
        self.recover_under_lock().await
    }

    async fn recover_under_lock(&self) -> Result<ProgressSnapshot> {
        let _lock = self.write_lock.lock().await;

        let raw_head = self.fast.read(HEAD_KEY)?;
        let head = self.read_head()?;
        let mut repair = true;
        match (&head, raw_head) {
            (Some(head), _) => match self.verify_head(head).await? {
                HeadCheck::Valid(value) => match self.newer_than_head(head).await? {
                    None => return self.finish_load(value, true).await,
                    Some(newer) => {
                        warn!(
                            revision = head.revision,
                            location = ?newer.location,
                            "Head pointer is stale, advancing to newest snapshot"
                        );
                        self.repair_head(&newer);
                        return self.finish_load(newer.value, true).await;
                    }
                },
                HeadCheck::Corrupt { bytes, reason } => {
                    warn!(%reason, revision = head.revision, "Head does not match its snapshot");
                    if let Err(e) = self.quarantine(Some(head), bytes, &reason).await {
                        warn!(error = %e, "Continuing recovery without quarantine copy");
                    }
                }
                HeadCheck::Unverifiable => repair = false,
            },
            (None, Some(bytes)) => {
                let reason = "head pointer is unreadable";
                warn!(reason, "Quarantining head pointer");
                if let Err(e) = self.quarantine(None, Some(bytes), reason).await {
                    warn!(error = %e, "Continuing recovery without quarantine copy");
                }
            }
            (None, None) => debug!("No head pointer, scanning for snapshots"),
        }

        match self.recover().await? {
            Some(recovered) => {
                info!(location = ?recovered.location, "Recovered most recent valid snapshot");
                if repair {
                    self.repair_head(&recovered);
                }
                self.finish_load(recovered.value, false).await
            }
            None => {
                debug!("No valid snapshot found, starting from defaults");
                let mut snapshot = ProgressSnapshot::default();
                snapshot.checksum = checksum::checksum(&snapshot);
                Ok(snapshot)
            }
        }
    }

    /// Newest snapshot that passes its own checksum, durable store first.
    async fn recover(&self) -> Result<Option<Recovered>> {
        if let Some(recovered) = self.scan_durable(None).await? {
            return Ok(Some(recovered));
        }

        Ok(self
            .fast
            .read(SNAPSHOT_KEY)?
            .and_then(|bytes| checksum::verified_value(&bytes))
            .map(|value| Recovered {
                value,
                location: SnapshotLocation::Fast,
            }))
    }

    /// A verified durable snapshot written after the one `head` names.
    ///
    /// Non-empty when a commit stored its snapshot but could not move the
    /// head.
    async fn newer_than_head(&self, head: &HeadPointer) -> Result<Option<Recovered>> {
        match head.location {
            SnapshotLocation::Durable { id } => self.scan_durable(Some(id)).await,
            SnapshotLocation::Fast => Ok(None),
        }
    }

    /// Scan durable snapshots newest-first, optionally only those with an
    /// id above `after`, returning the first that self-verifies.
    async fn scan_durable(&self, after: Option<RecordId>) -> Result<Option<Recovered>> {
        if !self.is_durable_available() {
            return Ok(None);
        }

        let records = self
            .durable_call(self.durable.list(SNAPSHOT_COLLECTION))
            .await?;
        for meta in records
            .iter()
            .rev()
            .take_while(|meta| after.is_none_or(|after| meta.id > after))
        {
            let record = match self
                .durable_call(self.durable.read(SNAPSHOT_COLLECTION, meta.id))
                .await
            {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(record_id = %meta.id, error = %e, "Skipping unreadable snapshot");
                    continue;
                }
            };
            match checksum::verified_value(&record.bytes) {
                Some(value) => {
                    return Ok(Some(Recovered {
                        value,
                        location: SnapshotLocation::Durable { id: meta.id },
                    }))
                }
                None => debug!(record_id = %meta.id, "Snapshot fails checksum, skipping"),
            }
        }
        Ok(None)
    }

    /// Point the head at a recovered snapshot so later reads agree.
    fn repair_head(&self, recovered: &Recovered) {
        let Some(checksum) = recovered.value.get("checksum").and_then(Value::as_str) else {
            return;
        };
        let schema_version = recovered
            .value
            .get("schemaVersion")
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(1);

        let revision = self.revision.load(Ordering::SeqCst) + 1;
        let head = HeadPointer {
            schema_version,
            checksum: checksum.to_string(),
            location: recovered.location,
            revision,
            written_at: Utc::now(),
        };
        match self.write_head(&head) {
            Ok(()) => {
                self.revision.store(revision, Ordering::SeqCst);
                debug!(revision, "Head pointer repaired");
            }
            Err(e) => warn!(error = %e, "Head pointer repair failed"),
        }
    }

    /// Migrate and stamp a loaded snapshot. A snapshot read through a
    /// valid head becomes the dedup baseline when no write is pending.
    async fn finish_load(&self, value: Value, trusted: bool) -> Result<ProgressSnapshot> {
        let mut snapshot = self.migrator.migrate_value(value)?;
        snapshot.checksum = checksum::checksum(&snapshot);

        if trusted {
            let mut gate = self.gate.lock().await;
            if gate.phase == WritePhase::Idle && gate.queued.is_none() {
                gate.last_committed = Some(checksum::fingerprint(&snapshot));
            }
        }
        Ok(snapshot)
    }

    pub(super) async fn cleanup_locked(&self, retention_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let removed = self.prune_snapshots(Some(cutoff)).await?;

        if let Err(e) = self
            .fast
            .write(LAST_CLEANUP_KEY, Utc::now().to_rfc3339().as_bytes())
        {
            warn!(error = %e, "Could not record cleanup time");
        }
        info!(removed, retention_days, "Snapshot cleanup completed");
        self.events
            .emit(StoreEvent::CleanupCompleted { removed })
            .await;
        Ok(removed)
    }

    /// Run cleanup when the cadence has elapsed since the recorded last run.
    pub(super) async fn maybe_cleanup_locked(&self) {
        let due = match self.fast.read(LAST_CLEANUP_KEY) {
            Ok(Some(bytes)) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|at| Utc::now() - at.with_timezone(&Utc) >= self.config.cleanup_interval())
                .unwrap_or(true),
            Ok(None) => true,
            Err(e) => {
                warn!(error = %e, "Could not read last cleanup time");
                return;
            }
        };
        if due {
            if let Err(e) = self.cleanup_locked(self.config.retention_days).await {
                warn!(error = %e, "Scheduled cleanup failed");
            }
        }
    }

    pub(super) async fn check_storage_quota(&self) -> Result<QuotaReport> {
        let fast = self.fast.estimate_usage()?;
        let durable = if self.is_durable_available() {
            self.durable_call(self.durable.estimate_usage()).await?
        } else {
            Usage::default()
        };

        let used_bytes = fast.used_bytes + durable.used_bytes;
        let quota_bytes = fast.quota_bytes + durable.quota_bytes;
        let percentage = if quota_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / quota_bytes as f64 * 100.0
        };
        let high_water = self.config.quota_high_water;
        let report = QuotaReport {
            used_bytes,
            quota_bytes,
            percentage,
            fast,
            durable,
            warning: fast.ratio() >= high_water || durable.ratio() >= high_water,
        };

        *self.last_quota.write().await = Some(report.clone());
        if report.warning {
            warn!(
                used_bytes,
                quota_bytes,
                fast_ratio = fast.ratio(),
                durable_ratio = durable.ratio(),
                "Storage usage above high-water mark"
            );
            self.events
                .emit(StoreEvent::QuotaWarning(report.clone()))
                .await;
        }
        Ok(report)
    }

    pub(super) async fn quarantined(&self) -> Result<Option<QuarantineRecord>> {
        if let Some(bytes) = self.fast.read(QUARANTINE_KEY)? {
            return serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Storage(e.to_string()));
        }
        if !self.is_durable_available() {
            return Ok(None);
        }

        let records = self
            .durable_call(self.durable.list(QUARANTINE_COLLECTION))
            .await?;
        let Some(newest) = records.last() else {
            return Ok(None);
        };
        match self
            .durable_call(self.durable.read(QUARANTINE_COLLECTION, newest.id))
            .await?
        {
            Some(record) => serde_json::from_slice(&record.bytes)
                .map(Some)
                .map_err(|e| StoreError::Storage(e.to_string())),
            None => Ok(None),
        }
    }
}
