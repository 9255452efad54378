//! Fan-out of versioned envelopes to current subscribers.
//!
//! Publication is fire-and-forget over a bounded broadcast channel: a
//! subscriber that stops draining lags out of the buffer and is dropped by
//! its own receive loop; the publisher never blocks on any one consumer.

use lotsync_core::event::Envelope;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Envelope>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to all current subscribers. Having no subscribers is normal.
    pub fn publish(&self, envelope: Envelope) {
        let delivered = self.tx.send(envelope).unwrap_or(0);
        debug!(delivered, "published event");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
