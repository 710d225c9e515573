//! Typed event fan-out between client components
//!
//! Each component exposes a finite set of event kinds as a single enum and
//! publishes them through an [`EventBus`]. Subscribers receive events in
//! emission order; a subscriber that falls behind loses the oldest events
//! and keeps receiving, it never blocks the publisher.

use tokio::sync::broadcast;

/// Broadcast bus for one component's event type
#[derive(Debug)]
pub struct EventBus<T> {
    tx: broadcast::Sender<T>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone> EventBus<T> {
    /// Create a bus retaining up to `capacity` undelivered events per
    /// subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to events emitted after this call
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Publish an event to all current subscribers
    ///
    /// Emitting with no subscribers is a no-op.
    pub fn emit(&self, event: T) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
