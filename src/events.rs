//! Typed store events and their observer hub.
//!
//! Listeners are called synchronously, in registration order, at the point
//! the event is emitted. Commit events are emitted while the coordinator's
//! gate is held, so listeners observe commits in commit order. Async
//! consumers use [`EventHub::receiver`] instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::checksum::Fingerprint;
use crate::coordinator::QuotaReport;

/// Handle returned by [`EventHub::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Something happened to stored progress.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A write from this store committed.
    Committed {
        fingerprint: Fingerprint,
        revision: u64,
        head_stale: bool,
    },
    /// Another tab committed and local state was invalidated.
    RemoteChange {
        fingerprint: Fingerprint,
        revision: u64,
        origin: Uuid,
    },
    /// Stored data failed checksum verification.
    CorruptionDetected { reason: String, quarantined: bool },
    /// The durable store is permanently unavailable; only the fast store is used.
    Degraded { reason: String },
    /// Usage crossed the high-water mark.
    QuotaWarning(QuotaReport),
    /// A durable write committed but the head pointer could not be updated.
    HeadWriteFailed { reason: String },
    /// Historical snapshots were pruned.
    CleanupCompleted { removed: usize },
}

impl StoreEvent {
    /// Events after which consumers should re-read via `load()`.
    pub fn is_progress_change(&self) -> bool {
        matches!(
            self,
            StoreEvent::Committed { .. } | StoreEvent::RemoteChange { .. }
        )
    }
}

type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Observer registry plus a broadcast channel for async consumers.
pub struct EventHub {
    sender: broadcast::Sender<StoreEvent>,
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener.
    pub async fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let count = {
            let mut listeners = self.listeners.write().await;
            listeners.push((id, Arc::new(listener)));
            listeners.len()
        };
        debug!(listener_count = count, "Listener subscribed");
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().await;
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Receiver for async consumers. Only sees events emitted after the call.
    pub fn receiver(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event to every listener, then to the broadcast channel.
    pub async fn emit(&self, event: StoreEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .await
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in &listeners {
            listener(&event);
        }

        // No receivers is fine; listeners may be the only consumers.
        let _ = self.sender.send(event);
    }
}
