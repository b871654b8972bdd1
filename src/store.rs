//! Public facade: the API application code calls.
//!
//! Composes the write coordinator, the cross-tab notifier and a local
//! snapshot cache behind an explicit `open`/`close` lifecycle. Adapters are
//! injected so tests can build isolated instances.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::StoreConfig;
use crate::coordinator::{
    CoordinatorStats, QuarantineRecord, QuotaReport, SaveOptions, SaveOutcome, SaveStatus,
    WriteCoordinator, WritePhase,
};
use crate::error::{Result, StoreError};
use crate::events::{StoreEvent, SubscriptionId};
use crate::model::ProgressSnapshot;
use crate::notifier::{CrossTabNotifier, SnapshotCache, TabChannel};
use crate::storage::{KeyValueStore, RecordStore};

/// Result of [`ProgressStore::save`]. Failures are reported in `error`
/// instead of as `Err`.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveResult {
    pub success: bool,
    /// Content unchanged since the last commit; nothing written.
    pub skipped: bool,
    /// Replaced by a newer save before it started; nothing written.
    pub superseded: bool,
    pub revision: Option<u64>,
    pub error: Option<StoreError>,
}

impl From<Result<SaveOutcome>> for SaveResult {
    fn from(result: Result<SaveOutcome>) -> Self {
        match result {
            Ok(outcome) => Self {
                success: true,
                skipped: outcome.status == SaveStatus::Skipped,
                superseded: outcome.status == SaveStatus::Superseded,
                revision: outcome.revision,
                error: None,
            },
            Err(e) => Self {
                success: false,
                skipped: false,
                superseded: false,
                revision: None,
                error: Some(e),
            },
        }
    }
}

/// Storage health summary for status banners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageHealth {
    /// Only the fast store is in use; the user should export manually.
    pub degraded: bool,
    pub corruption_detected: bool,
    pub last_quota: Option<QuotaReport>,
    pub stats: CoordinatorStats,
    pub phase: WritePhase,
}

/// Durable quiz-progress store.
pub struct ProgressStore {
    coordinator: WriteCoordinator,
    cache: Arc<SnapshotCache>,
    notifier: CrossTabNotifier,
    invalidation: SubscriptionId,
}

impl ProgressStore {
    /// Open the store over the given adapters and tab channel.
    pub async fn open(
        fast: Arc<dyn KeyValueStore>,
        durable: Arc<dyn RecordStore>,
        channel: Arc<dyn TabChannel>,
        config: StoreConfig,
    ) -> Result<Self> {
        let coordinator = WriteCoordinator::new(fast, durable, config);
        let cache = Arc::new(SnapshotCache::new());

        // Local commits make the cached copy stale before the save resolves.
        let invalidation = {
            let cache = Arc::clone(&cache);
            coordinator
                .events()
                .subscribe(move |event| {
                    if let StoreEvent::Committed { .. } = event {
                        cache.invalidate();
                    }
                })
                .await
        };
        let notifier = CrossTabNotifier::start(coordinator.clone(), channel, Arc::clone(&cache));

        coordinator.open().await?;
        if let Err(e) = coordinator.check_storage_quota().await {
            warn!(error = %e, "Initial quota check failed");
        }

        info!(
            origin_id = %notifier.origin_id(),
            degraded = coordinator.is_degraded(),
            "Progress store opened"
        );
        Ok(Self {
            coordinator,
            cache,
            notifier,
            invalidation,
        })
    }

    /// Current snapshot, from the cache when it is fresh.
    pub async fn load(&self) -> Result<ProgressSnapshot> {
        if let Some(snapshot) = self.cache.get() {
            return Ok(snapshot);
        }
        let generation = self.cache.generation();
        let snapshot = self.coordinator.load().await?;
        self.cache.fill(generation, snapshot.clone());
        Ok(snapshot)
    }

    pub async fn save(&self, snapshot: ProgressSnapshot, options: SaveOptions) -> SaveResult {
        SaveResult::from(self.coordinator.save(snapshot, options).await)
    }

    /// Register for "progress changed" notifications: local commits and
    /// remote invalidations. Re-read with [`load`](Self::load).
    pub async fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.coordinator
            .events()
            .subscribe(move |event| {
                if event.is_progress_change() {
                    listener(event);
                }
            })
            .await
    }

    /// Register for every store event, including degraded-mode, quota and
    /// corruption signals.
    pub async fn subscribe_events<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.coordinator.events().subscribe(listener).await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.coordinator.events().unsubscribe(id).await
    }

    /// Commit any queued save now and wait for it.
    pub async fn flush(&self) -> Result<()> {
        self.coordinator.flush().await
    }

    pub async fn check_storage_quota(&self) -> Result<QuotaReport> {
        self.coordinator.check_storage_quota().await
    }

    pub async fn cleanup(&self, retention_days: u32) -> Result<usize> {
        self.coordinator.cleanup(retention_days).await
    }

    pub fn is_degraded(&self) -> bool {
        self.coordinator.is_degraded()
    }

    pub async fn health(&self) -> StorageHealth {
        StorageHealth {
            degraded: self.coordinator.is_degraded(),
            corruption_detected: self.coordinator.corruption_seen(),
            last_quota: self.coordinator.last_quota().await,
            stats: self.coordinator.stats(),
            phase: self.coordinator.phase(),
        }
    }

    pub async fn quarantined(&self) -> Result<Option<QuarantineRecord>> {
        self.coordinator.quarantined().await
    }

    pub fn coordinator(&self) -> &WriteCoordinator {
        &self.coordinator
    }

    /// Drain pending saves, stop cross-tab notifications and reject
    /// further use.
    pub async fn close(self) -> Result<()> {
        self.coordinator.close().await?;
        self.coordinator.events().unsubscribe(self.invalidation).await;
        self.notifier.stop();
        self.cache.invalidate();
        info!("Progress store closed");
        Ok(())
    }
}
