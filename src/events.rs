//! Typed observer bus for critical state transitions.
//!
//! Collaborators subscribe to hear about boundary breaches, emergency
//! shutdown, and reclamation passes without coupling to the components that
//! raise them. Publishing never blocks and tolerates having no subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Critical state transitions raised by the resilience runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ResilienceEvent {
    /// An error boundary latched into the breached state.
    BoundaryBreached { name: String, error_count: usize },
    /// Emergency shutdown was initiated. Published exactly once.
    EmergencyShutdown { reason: String },
    /// A reclamation pass released stale resources.
    ResourcesReclaimed { count: usize },
}

/// Broadcast bus for [`ResilienceEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ResilienceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to future events. Slow subscribers may observe lag, never
    /// block publishers.
    pub fn subscribe(&self) -> broadcast::Receiver<ResilienceEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A send error just means nobody is listening.
    pub fn publish(&self, event: ResilienceEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::debug!("event_unobserved: {:?}", event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
