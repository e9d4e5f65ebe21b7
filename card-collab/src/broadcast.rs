//! Room fan-out to N-1 peers.
//!
//! Uses a tokio broadcast channel per room: one send reaches every
//! subscriber, and each subscriber buffers up to `capacity` relays. The
//! sender never waits on a slow peer; a peer that falls behind gets
//! `Lagged` on its receiver and is resynchronized by the gateway.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::Frame;

/// Connection identity inside the gateway.
pub type ConnId = u64;

/// A frame plus the connection it came from, so receivers can skip their own.
#[derive(Debug, Clone)]
pub struct Relay {
    pub origin: ConnId,
    pub frame: Frame,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Relay>>,
}

impl BroadcastGroup {
    /// `capacity` bounds how many relays a lagging subscriber may buffer.
    /// Zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Relay>> {
        self.sender.subscribe()
    }

    /// Fan a frame out to every subscriber. Filtering the origin is the
    /// receiver's job. Returns how many subscribers were reached.
    pub fn send(&self, origin: ConnId, frame: Frame) -> usize {
        self.sender
            .send(Arc::new(Relay { origin, frame }))
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    fn frame(s: &str) -> Frame {
        Arc::from(s)
    }

    #[tokio::test]
    async fn test_fan_out_includes_origin() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();

        assert_eq!(group.send(1, frame("a")), 2);

        let got = rx1.recv().await.unwrap();
        assert_eq!(got.origin, 1);
        assert_eq!(&*got.frame, "a");
        assert_eq!(&*rx2.recv().await.unwrap().frame, "a");
    }

    #[tokio::test]
    async fn test_send_without_subscribers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.send(1, frame("lost")), 0);
    }

    #[tokio::test]
    async fn test_order_preserved() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.subscribe();
        for i in 0..5 {
            group.send(1, frame(&i.to_string()));
        }
        for i in 0..5 {
            assert_eq!(&*rx.recv().await.unwrap().frame, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_lagging_subscriber_does_not_block_sender() {
        let group = BroadcastGroup::new(2);
        let mut slow = group.subscribe();
        for i in 0..5 {
            group.send(1, frame(&i.to_string()));
        }
        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(_))));
    }

    #[tokio::test]
    async fn test_subscriber_count() {
        let group = BroadcastGroup::new(8);
        let rx = group.subscribe();
        assert_eq!(group.subscriber_count(), 1);
        drop(rx);
        assert_eq!(group.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_still_relays() {
        let group = BroadcastGroup::new(0);
        let mut rx = group.subscribe();
        assert_eq!(group.send(1, frame("a")), 1);
        assert_eq!(&*rx.recv().await.unwrap().frame, "a");
    }
}
