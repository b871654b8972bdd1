//! Cross-tab change notification.
//!
//! Every local commit is published as a [`TabMessage`] on a shared
//! [`TabChannel`]. Messages from other origins whose fingerprint differs
//! from the local last-committed one invalidate the in-memory snapshot and
//! trigger a reload. Delivery is best effort: there is no acknowledgement
//! or retry, and the head pointer stays the source of truth.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checksum::Fingerprint;
use crate::coordinator::WriteCoordinator;
use crate::error::Result;
use crate::events::StoreEvent;
use crate::model::ProgressSnapshot;

/// Broadcast payload announcing a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabMessage {
    pub fingerprint: Fingerprint,
    /// Head revision written by the commit.
    pub head_version: u64,
    pub origin_id: Uuid,
}

/// Same-origin broadcast medium shared by every open tab.
#[async_trait]
pub trait TabChannel: Send + Sync {
    /// Publish to every subscriber, including the sender's own.
    async fn publish(&self, message: TabMessage) -> Result<()>;

    /// Receive messages published after this call.
    fn subscribe(&self) -> broadcast::Receiver<TabMessage>;
}

/// In-process channel. Clones share one broadcast medium, so each clone
/// stands in for one tab.
#[derive(Clone)]
pub struct LocalTabChannel {
    sender: broadcast::Sender<TabMessage>,
}

impl LocalTabChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

#[async_trait]
impl TabChannel for LocalTabChannel {
    async fn publish(&self, message: TabMessage) -> Result<()> {
        // No receivers just means no other tab is open.
        match self.sender.send(message) {
            Ok(receivers) => debug!(receivers, "Published tab message"),
            Err(_) => debug!("No tabs listening"),
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TabMessage> {
        self.sender.subscribe()
    }
}

/// Local in-memory copy of the current snapshot.
///
/// Every invalidation bumps a generation; a reload only fills the cache if
/// no invalidation happened since it started.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    state: RwLock<CacheState>,
}

#[derive(Debug, Default)]
struct CacheState {
    generation: u64,
    snapshot: Option<ProgressSnapshot>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<ProgressSnapshot> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot
            .clone()
    }

    pub fn generation(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .generation
    }

    /// Mark stale. Returns the new generation.
    pub fn invalidate(&self) -> u64 {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.generation += 1;
        state.snapshot = None;
        state.generation
    }

    /// Store a snapshot read at `generation`. Returns false if the cache
    /// was invalidated in the meantime.
    pub fn fill(&self, generation: u64, snapshot: ProgressSnapshot) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.generation != generation {
            return false;
        }
        state.snapshot = Some(snapshot);
        true
    }
}

/// Bridges coordinator commits and a [`TabChannel`].
pub struct CrossTabNotifier {
    origin_id: Uuid,
    tasks: Vec<JoinHandle<()>>,
}

impl CrossTabNotifier {
    /// Start publishing local commits and consuming remote ones.
    pub fn start(
        coordinator: WriteCoordinator,
        channel: Arc<dyn TabChannel>,
        cache: Arc<SnapshotCache>,
    ) -> Self {
        let origin_id = Uuid::new_v4();
        let outbound = tokio::spawn(publish_commits(
            coordinator.events().receiver(),
            Arc::clone(&channel),
            origin_id,
        ));
        let inbound = tokio::spawn(consume_remote(
            coordinator,
            channel.subscribe(),
            cache,
            origin_id,
        ));

        info!(%origin_id, "Cross-tab notifier started");
        Self {
            origin_id,
            tasks: vec![outbound, inbound],
        }
    }

    pub fn origin_id(&self) -> Uuid {
        self.origin_id
    }

    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for CrossTabNotifier {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn publish_commits(
    mut events: broadcast::Receiver<StoreEvent>,
    channel: Arc<dyn TabChannel>,
    origin_id: Uuid,
) {
    loop {
        match events.recv().await {
            Ok(StoreEvent::Committed {
                fingerprint,
                revision,
                ..
            }) => {
                let message = TabMessage {
                    fingerprint,
                    head_version: revision,
                    origin_id,
                };
                if let Err(e) = channel.publish(message).await {
                    warn!(error = %e, "Failed to publish tab message");
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                error!(skipped = n, "Commit publisher lagged, skipped events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn consume_remote(
    coordinator: WriteCoordinator,
    mut messages: broadcast::Receiver<TabMessage>,
    cache: Arc<SnapshotCache>,
    origin_id: Uuid,
) {
    loop {
        match messages.recv().await {
            Ok(message) => handle_remote(&coordinator, &cache, origin_id, message).await,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Tab channel lagged, reloading");
                reload(&coordinator, &cache).await;
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("Tab channel closed, stopping consumer");
                break;
            }
        }
    }
}

async fn handle_remote(
    coordinator: &WriteCoordinator,
    cache: &SnapshotCache,
    origin_id: Uuid,
    message: TabMessage,
) {
    if message.origin_id == origin_id {
        return;
    }
    if coordinator.last_committed().await.as_ref() == Some(&message.fingerprint) {
        debug!(fingerprint = %message.fingerprint, "Remote commit already known");
        return;
    }

    debug!(
        origin = %message.origin_id,
        revision = message.head_version,
        "Remote commit, invalidating local snapshot"
    );
    if reload(coordinator, cache).await {
        coordinator
            .events()
            .emit(StoreEvent::RemoteChange {
                fingerprint: message.fingerprint,
                revision: message.head_version,
                origin: message.origin_id,
            })
            .await;
    }
}

async fn reload(coordinator: &WriteCoordinator, cache: &SnapshotCache) -> bool {
    let generation = cache.invalidate();
    match coordinator.load().await {
        Ok(snapshot) => {
            cache.fill(generation, snapshot);
            true
        }
        Err(e) => {
            warn!(error = %e, "Reload after remote change failed");
            false
        }
    }
}
