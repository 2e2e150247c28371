//! Topic-keyed event bus.
//!
//! A single broadcast channel fans out every event to every subscriber;
//! subscriptions filter by topic on receive. Events carry a bus-wide
//! sequence number so consumers can check ordering.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 1024;

/// Kind of change an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// A new object appeared.
    Added,
    /// An existing object changed.
    Changed,
    /// An object went away.
    Removed,
}

/// One event on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Bus-wide sequence number, starting at 1.
    pub seq: u64,
    /// Topic, e.g. `core.get_jobs`.
    pub topic: String,
    /// Kind of change.
    pub kind: EventKind,
    /// Payload.
    pub fields: Value,
}

/// Subscription receive errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    /// The bus was dropped.
    #[error("event bus closed")]
    Closed,
}

/// Cloneable handle to the event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
    seq: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Bus buffering up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Returns the number of subscribers that will see it.
    pub fn publish(&self, topic: &str, kind: EventKind, fields: Value) -> usize {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = BusEvent {
            seq,
            topic: topic.to_string(),
            kind,
            fields,
        };
        match self.sender.send(event) {
            Ok(n) => n,
            Err(_) => {
                debug!(topic, seq, "event published with no subscribers");
                0
            }
        }
    }

    /// Subscribe to a single topic.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            topic: Some(topic.to_string()),
        }
    }

    /// Subscribe to every topic.
    pub fn subscribe_all(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            topic: None,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving end of a topic subscription.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<BusEvent>,
    topic: Option<String>,
}

impl Subscription {
    fn wants(&self, event: &BusEvent) -> bool {
        self.topic.as_deref().map_or(true, |t| t == event.topic)
    }

    /// Wait for the next matching event. Lagged events are skipped with a
    /// warning.
    pub async fn recv(&mut self) -> Result<BusEvent, EventError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.wants(&event) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, skipped = n, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(EventError::Closed),
            }
        }
    }

    /// Next matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, skipped = n, "event subscriber lagged");
                }
                Err(_) => return None,
            }
        }
    }

    /// Drain every buffered matching event.
    pub fn drain(&mut self) -> Vec<BusEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_topic_filtering() {
        let bus = EventBus::default();
        let mut jobs = bus.subscribe("core.get_jobs");
        let mut all = bus.subscribe_all();

        bus.publish("failover.status", EventKind::Changed, json!({"status": "MASTER"}));
        bus.publish("core.get_jobs", EventKind::Added, json!({"id": 1}));

        let ev = jobs.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Added);
        assert_eq!(ev.fields["id"], 1);
        assert!(jobs.try_recv().is_none());

        assert_eq!(all.drain().len(), 2);
    }

    #[test]
    fn test_sequence_monotonic() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_all();
        for i in 0..5 {
            bus.publish("t", EventKind::Changed, json!(i));
        }
        let seqs: Vec<u64> = sub.drain().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish("t", EventKind::Removed, Value::Null), 0);
    }

    #[test]
    fn test_kind_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&EventKind::Changed).unwrap(), "\"CHANGED\"");
    }

    #[test]
    fn test_lagged_subscriber_keeps_going() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe("t");
        for i in 0..5 {
            bus.publish("t", EventKind::Changed, json!(i));
        }
        let got = sub.drain();
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].fields, json!(4));
    }
}
