//! Per-session event bus
//!
//! A broadcast channel of [`ChatEvent`]s. Subscribers join and leave freely;
//! late joiners see only future events. Each subscriber gets a bounded buffer
//! of `capacity` events; one that falls further behind observes `Lagged` and
//! is expected to disconnect (the WebSocket forwarder closes on lag), so a
//! slow consumer never blocks the producer or its peers.

use tokio::sync::broadcast;

use parley_core::ChatEvent;

/// Publish/subscribe fan-out for one session.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: ChatEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, n: usize) -> ChatEvent {
        ChatEvent::AgentChunk {
            message_id: id.into(),
            sender: "maid".into(),
            content: format!("c{}", n),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.publish(chunk("m1", 0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        for n in 0..3 {
            bus.publish(chunk("m1", n));
        }
        for n in 0..3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event, chunk("m1", n));
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_past_events() {
        let bus = EventBus::new(8);
        bus.publish(chunk("m1", 0));
        let mut rx = bus.subscribe();
        bus.publish(chunk("m1", 1));
        assert_eq!(rx.recv().await.unwrap(), chunk("m1", 1));
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_without_blocking_producer() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe();
        for n in 0..32 {
            bus.publish(chunk("m1", n));
        }
        match slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed > 0),
            other => panic!("expected lag, got {:?}", other),
        }
    }
}
