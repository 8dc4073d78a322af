//! In-process publish/subscribe.
//!
//! Every subscriber owns an unbounded channel, so each one sees every event
//! published after it subscribed. Dropping the receiver unsubscribes.

use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::peer::PeerStatus;
use crate::swarm::PeerId;

#[derive(Debug)]
pub struct EventBus<E> {
    subscribers: Mutex<Vec<UnboundedSender<E>>>,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<E> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, pruning closed ones.
    pub fn publish(&self, event: E) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Events reported to whoever drives a download.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    /// Percentage of the content downloaded, 0 to 100
    Progress(f64),
    PeerState {
        peer: PeerId,
        addr: std::net::SocketAddr,
        status: PeerStatus,
    },
    ChunkVerified(u32),
    /// Every chunk is verified; fired once
    Completed,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_every_event() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(1u32);
        bus.publish(2u32);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        drop(a);
        bus.publish("x");
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(b.recv().await, Some("x"));
    }
}
