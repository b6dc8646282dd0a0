//! Fan-out of child replies to connected stream subscribers.
//!
//! Each subscriber owns a bounded queue. Broadcast never waits on a queue: a
//! closed or full queue gets that subscriber dropped after the sweep, so one
//! slow reader cannot hold up the rest or grow memory without bound.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::bridge::protocol::ProtocolMessage;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Serialized protocol message, shared by every queue it was sent to.
pub type Payload = Arc<str>;

/// Unique identifier for a connected subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(uuid::Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("subscriber queue closed")]
    Closed,
    #[error("subscriber queue full")]
    Overflow,
}

/// Outcome of one broadcast sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

struct RegistryInner {
    members: DashMap<SubscriberId, mpsc::Sender<Payload>>,
    capacity: usize,
}

/// Concurrency-safe set of subscriber queues.
#[derive(Clone)]
pub struct SubscriberRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl SubscriberRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                members: DashMap::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn register(&self) -> Subscriber {
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.members.insert(id, tx);
        tracing::info!(subscriber = %id, total = self.len(), "Subscriber connected");
        Subscriber {
            id,
            rx,
            registry: self.clone(),
        }
    }

    /// Safe to call more than once.
    pub fn unregister(&self, id: SubscriberId) {
        if self.inner.members.remove(&id).is_some() {
            tracing::info!(subscriber = %id, remaining = self.len(), "Subscriber removed");
        }
    }

    pub fn broadcast(&self, message: &ProtocolMessage) -> BroadcastReport {
        let payload: Payload = match serde_json::to_string(message) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize broadcast message");
                return BroadcastReport::default();
            }
        };

        // Snapshot so no shard lock is held while sending.
        let snapshot: Vec<(SubscriberId, mpsc::Sender<Payload>)> = self
            .inner
            .members
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        tracing::info!(subscribers = snapshot.len(), "Broadcasting to subscribers");

        let mut report = BroadcastReport::default();
        let mut dead = Vec::new();
        for (id, tx) in snapshot {
            match deliver(&tx, Arc::clone(&payload)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(subscriber = %id, error = %e, "Failed to deliver to subscriber");
                    dead.push(id);
                }
            }
        }

        report.dropped = dead.len();
        for id in dead {
            self.unregister(id);
        }
        report
    }

    /// Drop every queue; subscriber streams end once drained.
    pub fn clear(&self) {
        let count = self.len();
        self.inner.members.clear();
        tracing::info!(released = count, "Released all subscribers");
    }

    pub fn len(&self) -> usize {
        self.inner.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.members.is_empty()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.inner.members.contains_key(&id)
    }
}

fn deliver(tx: &mpsc::Sender<Payload>, payload: Payload) -> Result<(), DeliveryError> {
    tx.try_send(payload).map_err(|e| match e {
        TrySendError::Closed(_) => DeliveryError::Closed,
        TrySendError::Full(_) => DeliveryError::Overflow,
    })
}

/// One connected reader. Unregisters itself on drop.
pub struct Subscriber {
    id: SubscriberId,
    rx: mpsc::Receiver<Payload>,
    registry: SubscriberRegistry,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next payload, or `None` once removed from the registry and drained.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    /// Close the queue without leaving the registry; the next broadcast
    /// finds it closed and removes it.
    #[cfg(test)]
    pub(crate) fn close(&mut self) {
        self.rx.close();
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(n: u64) -> ProtocolMessage {
        ProtocolMessage::from_value(json!({"jsonrpc": "2.0", "id": n, "result": n})).unwrap()
    }

    fn parse(payload: &Payload) -> serde_json::Value {
        serde_json::from_str(payload).unwrap()
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber_in_order() {
        let registry = SubscriberRegistry::default();
        let mut a = registry.register();
        let mut b = registry.register();

        for n in 0..3 {
            let report = registry.broadcast(&msg(n));
            assert_eq!(report.delivered, 2);
        }

        for sub in [&mut a, &mut b] {
            for n in 0..3 {
                let payload = sub.recv().await.unwrap();
                assert_eq!(parse(&payload)["id"], n);
            }
        }
    }

    #[tokio::test]
    async fn late_subscriber_gets_no_replay() {
        let registry = SubscriberRegistry::default();
        let _early = registry.register();
        registry.broadcast(&msg(1));

        let mut late = registry.register();
        registry.broadcast(&msg(2));

        let payload = late.recv().await.unwrap();
        assert_eq!(parse(&payload)["id"], 2);
    }

    #[tokio::test]
    async fn closed_subscriber_is_removed_without_affecting_others() {
        let registry = SubscriberRegistry::default();
        let mut healthy = registry.register();
        let mut broken = registry.register();
        broken.close();

        let report = registry.broadcast(&msg(1));

        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });
        assert!(!registry.contains(broken.id()));
        assert!(registry.contains(healthy.id()));
        assert_eq!(parse(&healthy.recv().await.unwrap())["id"], 1);
    }

    #[tokio::test]
    async fn overflowing_subscriber_is_disconnected() {
        let registry = SubscriberRegistry::new(2);
        let slow = registry.register();
        let mut fast = registry.register();

        for n in 0..3 {
            registry.broadcast(&msg(n));
            fast.recv().await.unwrap();
        }

        assert!(!registry.contains(slow.id()));
        assert!(registry.contains(fast.id()));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_drop_unregisters() {
        let registry = SubscriberRegistry::default();
        let sub = registry.register();
        let id = sub.id();

        registry.unregister(id);
        registry.unregister(id);
        assert!(registry.is_empty());

        let other = registry.register();
        assert_eq!(registry.len(), 1);
        drop(other);
        assert!(registry.is_empty());
        drop(sub);
    }

    #[tokio::test]
    async fn clear_ends_subscriber_streams() {
        let registry = SubscriberRegistry::default();
        let mut sub = registry.register();
        registry.broadcast(&msg(1));

        registry.clear();

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
        assert!(registry.is_empty());
    }
}
