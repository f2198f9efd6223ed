use crate::protocol::EventSource;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Per-subscriber queue capacity
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 16;

/// `tree_changed` notification sent to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeChangedEvent {
    pub kind: &'static str,
    pub event: &'static str,
    pub version: String,
    pub changed_node_ids: Vec<String>,
    pub generated_at: i64,
}

impl TreeChangedEvent {
    pub fn new(version: String, changed_node_ids: Vec<String>, generated_at: i64) -> Self {
        Self {
            kind: "event",
            event: "tree_changed",
            version,
            changed_node_ids,
            generated_at,
        }
    }
}

/// Delivery counts from one broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Change notification hub
///
/// Fan-out is best-effort: each subscriber has a bounded queue and a full
/// queue drops that subscriber's copy of the event. Broadcasting never waits
/// on a consumer.
#[derive(Debug, Default)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

#[derive(Debug, Default)]
struct HubInner {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Bytes>>>,
}

impl HubInner {
    fn subscribers(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<Bytes>>> {
        // A panic while holding the lock cannot leave the map half-updated
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn unregister(&self, id: u64) -> bool {
        // Dropping the sender closes the queue for the reader
        self.subscribers().remove(&id).is_some()
    }
}

/// A live registration; unregisters itself when dropped
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Bytes>,
    hub: Arc<HubInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next serialized event; `None` once unregistered
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.receiver.try_recv().ok()
    }
}

#[async_trait]
impl EventSource for Subscription {
    async fn next_event(&mut self) -> Option<Bytes> {
        self.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.hub.unregister(self.id) {
            debug!(subscription = self.id, "subscription dropped");
        }
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.inner.subscribers().insert(id, tx);
        debug!(subscription = id, "subscriber registered");
        Subscription {
            id,
            receiver: rx,
            hub: Arc::clone(&self.inner),
        }
    }

    /// Close a subscription's queue so a blocked reader observes termination
    pub fn unregister(&self, subscription_id: u64) {
        if self.inner.unregister(subscription_id) {
            debug!(subscription = subscription_id, "subscriber unregistered");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Serialize once, then enqueue without blocking on every subscriber
    pub fn broadcast<E: Serialize>(&self, event: &E) -> BroadcastReport {
        let payload = match serde_json::to_vec(event) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                error!("event serialization failed: {}", e);
                return BroadcastReport::default();
            }
        };

        let mut report = BroadcastReport::default();
        let subscribers = self.inner.subscribers();
        for (id, tx) in subscribers.iter() {
            match tx.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscription = id, "dropping event for slow subscriber");
                    report.dropped += 1;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Reader went away; Drop will unregister it
                    report.dropped += 1;
                }
            }
        }
        report
    }
}
