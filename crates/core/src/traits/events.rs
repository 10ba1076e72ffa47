use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::events::EventEnvelope;

/// Trait for emitting structured events.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    /// Emit an event.
    async fn emit(&self, event: EventEnvelope);
}

/// No-op implementation for testing/default.
pub struct NoOpEventEmitter;

#[async_trait]
impl EventEmitter for NoOpEventEmitter {
    async fn emit(&self, _event: EventEnvelope) {}
}

/// Fan-out emitter backed by a broadcast channel.
///
/// Observers call [`subscribe`](Self::subscribe); events emitted while nobody
/// listens are dropped.
pub struct BroadcastEventEmitter {
    tx: broadcast::Sender<EventEnvelope>,
}

impl BroadcastEventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventEmitter {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventEmitter for BroadcastEventEmitter {
    async fn emit(&self, event: EventEnvelope) {
        let _ = self.tx.send(event);
    }
}
