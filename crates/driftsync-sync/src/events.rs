//! Typed event bus.
//!
//! A thin wrapper over [`tokio::sync::broadcast`]. Emitting never blocks and
//! never fails: events sent while nobody listens are dropped, and a slow
//! subscriber that falls behind by more than the capacity loses the oldest
//! events. Dropping a receiver unsubscribes it.

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBus<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: E) {
        // Err only means there are no subscribers.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(1u32);
        bus.emit(2u32);

        assert_eq!(first.recv().await.unwrap(), 1);
        assert_eq!(first.recv().await.unwrap(), 2);
        assert_eq!(second.recv().await.unwrap(), 1);
    }

    #[test]
    fn test_emit_without_subscribers_is_silent() {
        let bus: EventBus<&str> = EventBus::default();
        bus.emit("nobody listens");
        let receiver = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        drop(receiver);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
