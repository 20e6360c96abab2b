//! Event hub for pushing room/capacity snapshots to SSE subscribers.
//!
//! Delivery is best-effort and per-subscriber: a full buffer gets one
//! queued (spawned) send, repeated overflow drops the subscriber, and a
//! closed receiver is pruned on the next broadcast.

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Buffered snapshots a subscriber may fall behind by before sends start
/// failing.
const SUBSCRIBER_BUFFER: usize = 16;

/// Overflow strikes before a slow subscriber is dropped.
const MAX_FAILURES: u32 = 3;

struct Subscriber {
    tx: mpsc::Sender<String>,
    failures: u32,
}

/// Fan-out hub for serialized JSON snapshots.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber and returns its receiving end.
    ///
    /// The caller is responsible for sending the initial snapshot; the
    /// hub only delivers subsequent updates.
    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().push(Subscriber { tx, failures: 0 });
        rx
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Broadcasts one snapshot to every subscriber.
    pub fn broadcast(&self, payload: &serde_json::Value) {
        let serialized = payload.to_string();
        let mut subscribers = self.subscribers.lock();
        tracing::debug!(subscribers = subscribers.len(), "rooms_snapshot");
        subscribers.retain_mut(|sub| {
            match sub.tx.try_send(serialized.clone()) {
                Ok(()) => {
                    sub.failures = 0;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
                Err(mpsc::error::TrySendError::Full(payload)) => {
                    sub.failures += 1;
                    if sub.failures >= MAX_FAILURES {
                        log::warn!("[Events] Dropping subscriber that cannot keep up");
                        return false;
                    }
                    // Queue one blocking delivery off the broadcast path.
                    let tx = sub.tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(payload).await;
                    });
                    true
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let hub = EventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        hub.broadcast(&json!({"rooms": {}}));
        assert_eq!(a.recv().await.unwrap(), "{\"rooms\":{}}");
        assert_eq!(b.recv().await.unwrap(), "{\"rooms\":{}}");
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        drop(rx);
        hub.broadcast(&json!({}));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn broadcasts_arrive_in_mutation_order() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        hub.broadcast(&json!({"seq": 1}));
        hub.broadcast(&json!({"seq": 2}));
        assert!(rx.recv().await.unwrap().contains("1"));
        assert!(rx.recv().await.unwrap().contains("2"));
    }
}
