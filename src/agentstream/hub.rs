//! Live publish/subscribe fan-out for one path.
//!
//! The hub is a thin wrapper over a tokio broadcast channel: subscribers
//! hold receivers whose lifetime is scoped to the subscribe call, and the
//! channel drops a receiver's backlog when it falls behind, which the
//! [`EventStream`](crate::agentstream::stream::EventStream) surfaces as
//! [`StreamError::BackpressureDrop`](crate::agentstream::error::StreamError::BackpressureDrop).
//! Dropping a receiver removes it from the hub immediately.

use tokio::sync::broadcast;

use crate::agentstream::event::Event;

pub struct StreamHub {
    sender: broadcast::Sender<Event>,
}

impl StreamHub {
    /// Create a hub whose subscriber queues hold at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        StreamHub { sender }
    }

    /// Publish to all live subscribers. Events published with no subscriber
    /// are simply not fanned out; the durable log is the source of truth.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Register a new subscriber queue starting at the current position.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Number of live subscriber queues.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentstream::event::EventInput;
    use crate::agentstream::offset::Offset;
    use chrono::Utc;

    fn event(n: u64) -> Event {
        let input = EventInput::new("t", serde_json::json!({ "n": n }));
        Event {
            path: "p".into(),
            offset: Offset::new(n),
            event_type: input.event_type,
            payload: input.payload,
            version: None,
            created_at: Utc::now(),
            trace: None,
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let hub = StreamHub::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        hub.publish(event(0));
        assert_eq!(a.recv().await.unwrap().offset, Offset::new(0));
        assert_eq!(b.recv().await.unwrap().offset, Offset::new(0));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub = StreamHub::new(16);
        let rx = hub.subscribe();
        drop(rx);
        assert_eq!(hub.subscriber_count(), 0);
    }
}
