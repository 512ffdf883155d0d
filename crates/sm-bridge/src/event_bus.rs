use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::protocol::OrchestratorEvent;

/// Default bound on each subscriber's queue.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// A broadcast-style event bus built on bounded flume channels.
///
/// Publishing never blocks: each subscriber has its own bounded queue and
/// a subscriber that falls behind until its queue fills is disconnected
/// rather than allowed to stall producers. Per-subscriber ordering is
/// preserved; delivery is best-effort to live subscribers only.
///
/// The bus is cheap to clone (its internals live behind an `Arc`).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<Arc<OrchestratorEvent>>>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            capacity,
        }
    }

    /// Register a new subscriber receiving every event published from this
    /// point forward.
    pub fn subscribe(&self) -> flume::Receiver<Arc<OrchestratorEvent>> {
        self.subscribe_with_replay(Vec::new())
    }

    /// Register a subscriber whose stream starts with a replay of the
    /// given snapshot, followed by the live feed. The queue is sized to
    /// hold the whole snapshot so the replay cannot evict itself.
    pub fn subscribe_with_replay(
        &self,
        snapshot: Vec<OrchestratorEvent>,
    ) -> flume::Receiver<Arc<OrchestratorEvent>> {
        let (tx, rx) = flume::bounded(self.capacity + snapshot.len());
        for event in snapshot {
            let _ = tx.try_send(Arc::new(event));
        }
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        senders.push(tx);
        rx
    }

    /// Publish to all current subscribers without blocking. Subscribers
    /// that are gone or whose queue is full are pruned.
    pub fn publish(&self, event: OrchestratorEvent) {
        let event = Arc::new(event);
        let mut senders = self.inner.lock().expect("EventBus lock poisoned");
        let before = senders.len();
        senders.retain(|tx| tx.try_send(event.clone()).is_ok());
        let dropped = before - senders.len();
        if dropped > 0 {
            warn!(dropped, kind = event.kind(), "disconnected slow or dead subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("EventBus lock poisoned").len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str) -> OrchestratorEvent {
        OrchestratorEvent::TaskDeleted {
            task_id: id.to_string(),
        }
    }

    fn task_id(e: &OrchestratorEvent) -> String {
        match e {
            OrchestratorEvent::TaskDeleted { task_id } => task_id.clone(),
            _ => panic!("unexpected event"),
        }
    }

    #[test]
    fn subscribers_receive_in_order() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        bus.publish(event("a"));
        bus.publish(event("b"));

        let got: Vec<String> = rx.drain().map(|e| task_id(&e)).collect();
        assert_eq!(got, vec!["a", "b"]);
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        bus.publish(event("a"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn slow_subscriber_is_disconnected_not_blocking() {
        let bus = EventBus::with_capacity(2);
        let rx = bus.subscribe();
        // Fill the queue past capacity; the third publish disconnects.
        bus.publish(event("a"));
        bus.publish(event("b"));
        bus.publish(event("c"));
        assert_eq!(bus.subscriber_count(), 0);
        // The first two are still readable from the orphaned receiver.
        assert_eq!(rx.drain().count(), 2);
    }

    #[test]
    fn replay_precedes_live_stream() {
        let bus = EventBus::new();
        let rx = bus.subscribe_with_replay(vec![event("snap1"), event("snap2")]);
        bus.publish(event("live"));

        let got: Vec<String> = rx.drain().map(|e| task_id(&e)).collect();
        assert_eq!(got, vec!["snap1", "snap2", "live"]);
    }

    #[test]
    fn replay_larger_than_capacity_still_fits() {
        let bus = EventBus::with_capacity(1);
        let snapshot: Vec<OrchestratorEvent> = (0..10).map(|i| event(&i.to_string())).collect();
        let rx = bus.subscribe_with_replay(snapshot);
        assert_eq!(rx.drain().count(), 10);
    }
}
