//! Swarm events for external observability.
//!
//! Circuit-state and degradation-level changes are pushed to an [`EventSink`].
//! Delivery is best-effort: `emit` is synchronous and must never block, so the
//! default sink is a tokio broadcast channel whose slow receivers simply lag.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::circuit::CircuitState;
use crate::health::DegradationLevel;

/// Capacity of the broadcast channel used by [`BroadcastEventSink`].
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// An observable state change inside the swarm.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwarmEvent {
    CircuitStateChanged {
        provider: String,
        from: CircuitState,
        to: CircuitState,
        consecutive_failures: u32,
        at: DateTime<Utc>,
    },
    DegradationLevelChanged {
        from: DegradationLevel,
        to: DegradationLevel,
        error_rate: f64,
        at: DateTime<Utc>,
    },
}

/// Consumer of swarm events. Implementations must return promptly.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: SwarmEvent);
}

/// Event sink backed by a broadcast channel, also logging every event.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<SwarmEvent>,
}

impl BroadcastEventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: SwarmEvent) {
        match &event {
            SwarmEvent::CircuitStateChanged {
                provider, from, to, ..
            } => {
                tracing::info!(provider = %provider, from = %from, to = %to, "Circuit state changed");
            }
            SwarmEvent::DegradationLevelChanged {
                from,
                to,
                error_rate,
                ..
            } => {
                tracing::warn!(from = %from, to = %to, error_rate, "Degradation level changed");
            }
        }
        // No receivers is fine; the event is simply dropped.
        let _ = self.tx.send(event);
    }
}

/// Sink that discards everything.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: SwarmEvent) {}
}
