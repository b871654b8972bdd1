//! Write coordinator: the single writer of both storage backends.
//!
//! Every save passes through one gate (a mutex around "check dedup, check
//! lock, transition state"), so two callers can never both pass the dedup
//! check before one of them commits. Backend I/O runs behind a separate
//! write lock held by exactly one `perform_save` body at a time.
//!
//! Phases: `Idle -> Queued -> InFlight -> (Committed | Failed) -> Idle`.
//! At most one request waits in the queue; a newer save supersedes it.

mod persist;
mod recovery;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch, Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::checksum::{self, Fingerprint};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::events::{EventHub, StoreEvent};
use crate::migrate::Migrator;
use crate::model::{HeadPointer, ProgressSnapshot};
use crate::storage::{KeyValueStore, RecordStore, Usage};

/// Caller-supplied save options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOptions {
    /// Free-form reason, logged with the write.
    pub reason: String,
    /// Bypass dedup and the throttle window.
    pub force: bool,
}

impl SaveOptions {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            force: false,
        }
    }

    pub fn forced(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            force: true,
        }
    }
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self::new("unspecified")
    }
}

/// How a save request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveStatus {
    Committed,
    /// Content equal to the last committed snapshot; nothing written.
    Skipped,
    /// A newer request replaced this one before it started.
    Superseded,
}

/// Successful resolution of a save request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveOutcome {
    pub status: SaveStatus,
    pub sequence: u64,
    /// Head revision written, for committed saves.
    pub revision: Option<u64>,
    /// The snapshot is durable but the head pointer could not be updated.
    pub head_stale: bool,
}

impl SaveOutcome {
    fn skipped(sequence: u64) -> Self {
        Self {
            status: SaveStatus::Skipped,
            sequence,
            revision: None,
            head_stale: false,
        }
    }

    fn superseded(sequence: u64) -> Self {
        Self {
            status: SaveStatus::Superseded,
            sequence,
            revision: None,
            head_stale: false,
        }
    }
}

/// Coordinator state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WritePhase {
    Idle,
    Queued,
    InFlight,
    Committed,
    Failed,
}

/// Combined usage of both backends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaReport {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub percentage: f64,
    pub fast: Usage,
    pub durable: Usage,
    /// Either backend is at or above the high-water mark.
    pub warning: bool,
}

/// Counters since the coordinator was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    pub commits: u64,
    pub skipped: u64,
    pub superseded: u64,
    pub failures: u64,
    pub corruptions: u64,
    /// Highest number of `perform_save` bodies observed running at once.
    pub max_concurrent_writes: u64,
}

/// Preserved copy of data that failed verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineRecord {
    pub quarantined_at: DateTime<Utc>,
    pub reason: String,
    pub head: Option<HeadPointer>,
    /// Raw bytes of the rejected snapshot, hex encoded. `None` when the
    /// referenced snapshot was missing entirely.
    pub payload_hex: Option<String>,
}

struct SaveRequest {
    snapshot: ProgressSnapshot,
    options: SaveOptions,
    sequence: u64,
    fingerprint: Fingerprint,
    responder: oneshot::Sender<Result<SaveOutcome>>,
}

struct GateState {
    phase: WritePhase,
    next_sequence: u64,
    last_committed: Option<Fingerprint>,
    last_commit_at: Option<Instant>,
    queued: Option<SaveRequest>,
    flushers: u32,
    closed: bool,
}

#[derive(Default)]
struct StatsCounters {
    commits: AtomicU64,
    skipped: AtomicU64,
    superseded: AtomicU64,
    failures: AtomicU64,
    corruptions: AtomicU64,
    active_writes: AtomicU64,
    max_concurrent_writes: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> CoordinatorStats {
        CoordinatorStats {
            commits: self.commits.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            superseded: self.superseded.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
            corruptions: self.corruptions.load(Ordering::SeqCst),
            max_concurrent_writes: self.max_concurrent_writes.load(Ordering::SeqCst),
        }
    }
}

/// Tracks the number of running `perform_save` bodies.
struct ActiveWrite<'a> {
    counters: &'a StatsCounters,
}

impl<'a> ActiveWrite<'a> {
    fn enter(counters: &'a StatsCounters) -> Self {
        let now = counters.active_writes.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_concurrent_writes.fetch_max(now, Ordering::SeqCst);
        Self { counters }
    }
}

impl Drop for ActiveWrite<'_> {
    fn drop(&mut self) {
        self.counters.active_writes.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inner {
    fast: Arc<dyn KeyValueStore>,
    durable: Arc<dyn RecordStore>,
    durable_available: AtomicBool,
    migrator: Migrator,
    config: StoreConfig,
    gate: Mutex<GateState>,
    write_lock: Mutex<()>,
    phase_tx: watch::Sender<WritePhase>,
    wake: Notify,
    events: Arc<EventHub>,
    stats: StatsCounters,
    revision: AtomicU64,
    last_quota: RwLock<Option<QuotaReport>>,
    corruption_seen: AtomicBool,
}

/// Serializes saves against the fast and durable backends.
///
/// Cheap to clone; clones share one state machine.
#[derive(Clone)]
pub struct WriteCoordinator {
    inner: Arc<Inner>,
}

impl WriteCoordinator {
    pub fn new(
        fast: Arc<dyn KeyValueStore>,
        durable: Arc<dyn RecordStore>,
        config: StoreConfig,
    ) -> Self {
        Self::with_migrator(fast, durable, config, Migrator::default())
    }

    pub fn with_migrator(
        fast: Arc<dyn KeyValueStore>,
        durable: Arc<dyn RecordStore>,
        config: StoreConfig,
        migrator: Migrator,
    ) -> Self {
        let (phase_tx, _) = watch::channel(WritePhase::Idle);
        let events = Arc::new(EventHub::new(config.channel_capacity));
        Self {
            inner: Arc::new(Inner {
                fast,
                durable,
                durable_available: AtomicBool::new(true),
                migrator,
                config,
                gate: Mutex::new(GateState {
                    phase: WritePhase::Idle,
                    next_sequence: 0,
                    last_committed: None,
                    last_commit_at: None,
                    queued: None,
                    flushers: 0,
                    closed: false,
                }),
                write_lock: Mutex::new(()),
                phase_tx,
                wake: Notify::new(),
                events,
                stats: StatsCounters::default(),
                revision: AtomicU64::new(0),
                last_quota: RwLock::new(None),
                corruption_seen: AtomicBool::new(false),
            }),
        }
    }

    /// Open the durable backend and run any due cleanup.
    ///
    /// A durable backend that cannot be opened is unavailable for the rest
    /// of the session: the coordinator switches to fast-only storage and
    /// emits [`StoreEvent::Degraded`]. Only a failing fast backend is an
    /// error here.
    #[tracing::instrument(name = "coordinator.open", skip_all)]
    pub async fn open(&self) -> Result<()> {
        let inner = &self.inner;
        match inner.durable_call(inner.durable.open()).await {
            Ok(()) => debug!("Durable store opened"),
            Err(e) => inner.enter_degraded(&e.to_string()).await,
        }

        if let Some(head) = inner.read_head()? {
            inner.revision.store(head.revision, Ordering::SeqCst);
        }

        let _lock = inner.write_lock.lock().await;
        inner.maybe_cleanup_locked().await;
        Ok(())
    }

    /// Request a save. Resolves when the request commits, fails, is
    /// skipped as unchanged, or is superseded by a newer request.
    #[tracing::instrument(
        name = "coordinator.save",
        skip_all,
        fields(reason = %options.reason, force = options.force)
    )]
    pub async fn save(&self, snapshot: ProgressSnapshot, options: SaveOptions) -> Result<SaveOutcome> {
        let fingerprint = checksum::fingerprint(&snapshot);
        let inner = &self.inner;

        let rx = {
            let mut gate = inner.gate.lock().await;
            if gate.closed {
                return Err(StoreError::Closed);
            }
            gate.next_sequence += 1;
            let sequence = gate.next_sequence;

            if !options.force
                && gate.phase == WritePhase::Idle
                && gate.last_committed.as_ref() == Some(&fingerprint)
            {
                inner.stats.skipped.fetch_add(1, Ordering::SeqCst);
                debug!(sequence, %fingerprint, "Unchanged snapshot, skipping save");
                return Ok(SaveOutcome::skipped(sequence));
            }

            let force = options.force;
            let (tx, rx) = oneshot::channel();
            let request = SaveRequest {
                snapshot,
                options,
                sequence,
                fingerprint,
                responder: tx,
            };

            match gate.phase {
                WritePhase::Idle if force || inner.throttle_remaining(&gate).is_none() => {
                    inner.set_phase(&mut gate, WritePhase::InFlight);
                    tokio::spawn(Arc::clone(inner).drive(Some(request)));
                }
                WritePhase::Idle => {
                    debug!(sequence, "Inside throttle window, queueing save");
                    gate.queued = Some(request);
                    inner.set_phase(&mut gate, WritePhase::Queued);
                    tokio::spawn(Arc::clone(inner).drive(None));
                }
                _ => {
                    // An unchanged replacement resolves without waiting out the throttle.
                    let unchanged = gate.last_committed.as_ref() == Some(&request.fingerprint);
                    if let Some(stale) = gate.queued.replace(request) {
                        inner.supersede(stale);
                    }
                    if force || unchanged {
                        inner.wake.notify_one();
                    }
                }
            }
            rx
        };

        rx.await.unwrap_or(Err(StoreError::Closed))
    }

    /// Current snapshot, fully migrated and checksum-stamped.
    #[tracing::instrument(name = "coordinator.load", skip_all)]
    pub async fn load(&self) -> Result<ProgressSnapshot> {
        if self.inner.gate.lock().await.closed {
            return Err(StoreError::Closed);
        }
        self.inner.load().await
    }

    /// Remove historical snapshots older than `retention_days`.
    ///
    /// Never removes the snapshot the head points at or the newest one.
    #[tracing::instrument(name = "coordinator.cleanup", skip(self))]
    pub async fn cleanup(&self, retention_days: u32) -> Result<usize> {
        if self.inner.gate.lock().await.closed {
            return Err(StoreError::Closed);
        }
        let _lock = self.inner.write_lock.lock().await;
        self.inner.cleanup_locked(retention_days).await
    }

    /// Query both backends and emit a warning above the high-water mark.
    pub async fn check_storage_quota(&self) -> Result<QuotaReport> {
        self.inner.check_storage_quota().await
    }

    /// Start any queued request immediately and wait until the coordinator
    /// is idle again.
    pub async fn flush(&self) -> Result<()> {
        let inner = &self.inner;
        let mut phase_rx = inner.phase_tx.subscribe();
        {
            let mut gate = inner.gate.lock().await;
            if gate.phase == WritePhase::Idle {
                return Ok(());
            }
            gate.flushers += 1;
        }
        inner.wake.notify_one();

        let result = phase_rx
            .wait_for(|phase| *phase == WritePhase::Idle)
            .await
            .map(|_| ())
            .map_err(|_| StoreError::Closed);

        inner.gate.lock().await.flushers -= 1;
        result
    }

    /// Reject new saves and drain pending ones.
    pub async fn close(&self) -> Result<()> {
        self.inner.gate.lock().await.closed = true;
        self.flush().await?;
        info!("Write coordinator closed");
        Ok(())
    }

    /// Newest preserved corrupt payload, if any.
    pub async fn quarantined(&self) -> Result<Option<QuarantineRecord>> {
        self.inner.quarantined().await
    }

    pub fn is_degraded(&self) -> bool {
        !self.inner.is_durable_available()
    }

    pub fn corruption_seen(&self) -> bool {
        self.inner.corruption_seen.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> WritePhase {
        *self.inner.phase_tx.borrow()
    }

    /// Watch phase transitions.
    pub fn phase_receiver(&self) -> watch::Receiver<WritePhase> {
        self.inner.phase_tx.subscribe()
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.inner.stats.snapshot()
    }

    pub async fn last_committed(&self) -> Option<Fingerprint> {
        self.inner.gate.lock().await.last_committed.clone()
    }

    pub async fn last_quota(&self) -> Option<QuotaReport> {
        self.inner.last_quota.read().await.clone()
    }

    pub fn events(&self) -> Arc<EventHub> {
        Arc::clone(&self.inner.events)
    }
}

impl Inner {
    fn set_phase(&self, gate: &mut GateState, phase: WritePhase) {
        gate.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    fn throttle_remaining(&self, gate: &GateState) -> Option<Duration> {
        let last = gate.last_commit_at?;
        self.config
            .min_write_interval()
            .checked_sub(last.elapsed())
            .filter(|remaining| !remaining.is_zero())
    }

    fn supersede(&self, stale: SaveRequest) {
        self.stats.superseded.fetch_add(1, Ordering::SeqCst);
        debug!(sequence = stale.sequence, "Queued save superseded");
        let _ = stale
            .responder
            .send(Ok(SaveOutcome::superseded(stale.sequence)));
    }

    fn is_durable_available(&self) -> bool {
        self.durable_available.load(Ordering::SeqCst)
    }

    /// Run saves until the queue is empty. Exactly one drive task exists
    /// while the phase is not `Idle`.
    async fn drive(self: Arc<Self>, first: Option<SaveRequest>) {
        let mut next = first;
        loop {
            let request = match next.take() {
                Some(request) => request,
                None => match self.claim_queued().await {
                    Some(request) => request,
                    None => return,
                },
            };

            let result = self.run_save(&request).await;
            let mut gate = self.gate.lock().await;
            match result {
                Ok(outcome) => {
                    gate.last_committed = Some(request.fingerprint.clone());
                    gate.last_commit_at = Some(Instant::now());
                    self.set_phase(&mut gate, WritePhase::Committed);
                    self.events
                        .emit(StoreEvent::Committed {
                            fingerprint: request.fingerprint.clone(),
                            revision: outcome.revision.unwrap_or_default(),
                            head_stale: outcome.head_stale,
                        })
                        .await;

                    let more = gate.queued.is_some();
                    self.set_phase(
                        &mut gate,
                        if more { WritePhase::Queued } else { WritePhase::Idle },
                    );
                    drop(gate);
                    let _ = request.responder.send(Ok(outcome));
                    if !more {
                        return;
                    }
                }
                Err(e) => {
                    self.set_phase(&mut gate, WritePhase::Failed);
                    if let Some(queued) = gate.queued.take() {
                        debug!(sequence = queued.sequence, "Rejecting queued save");
                        let _ = queued.responder.send(Err(e.clone()));
                    }
                    self.set_phase(&mut gate, WritePhase::Idle);
                    drop(gate);
                    let _ = request.responder.send(Err(e));
                    return;
                }
            }
        }
    }

    /// Take the queued request once the throttle window has passed. A
    /// request equal to the last commit resolves as skipped without waiting.
    ///
    /// Returns `None` (and moves to `Idle`) once nothing is queued.
    async fn claim_queued(&self) -> Option<SaveRequest> {
        loop {
            let wait = {
                let mut gate = self.gate.lock().await;
                let Some(request) = gate.queued.take() else {
                    self.set_phase(&mut gate, WritePhase::Idle);
                    return None;
                };

                if !request.options.force
                    && gate.last_committed.as_ref() == Some(&request.fingerprint)
                {
                    self.stats.skipped.fetch_add(1, Ordering::SeqCst);
                    debug!(sequence = request.sequence, "Queued save unchanged, skipping");
                    let _ = request
                        .responder
                        .send(Ok(SaveOutcome::skipped(request.sequence)));
                    continue;
                }

                let wait = if request.options.force || gate.flushers > 0 {
                    None
                } else {
                    self.throttle_remaining(&gate)
                };
                match wait {
                    Some(wait) => {
                        gate.queued = Some(request);
                        wait
                    }
                    None => {
                        self.set_phase(&mut gate, WritePhase::InFlight);
                        return Some(request);
                    }
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn run_save(&self, request: &SaveRequest) -> Result<SaveOutcome> {
        let _lock = self.write_lock.lock().await;
        let result = {
            let _active = ActiveWrite::enter(&self.stats);
            self.perform_save(request).await
        };

        match &result {
            Ok(outcome) => {
                self.stats.commits.fetch_add(1, Ordering::SeqCst);
                info!(
                    sequence = request.sequence,
                    revision = outcome.revision,
                    reason = %request.options.reason,
                    "Progress committed"
                );
                self.maybe_cleanup_locked().await;
            }
            Err(e) => {
                self.stats.failures.fetch_add(1, Ordering::SeqCst);
                error!(sequence = request.sequence, error = %e, "Save failed");
            }
        }
        result
    }
}
