//! Framework-agnostic event broadcasting.
//!
//! The control plane publishes lifecycle events (sessions spawned and
//! exited, capability set changes, approval requests) on a single bus.
//! Interfaces such as the WebSocket endpoint subscribe and forward them.
//!
//! # Example
//!
//! ```rust
//! use marshal_core::event_bus::{topics, EventBus};
//! use std::sync::Arc;
//!
//! let event_bus = Arc::new(EventBus::new());
//! let mut rx = event_bus.subscribe();
//!
//! event_bus.emit(&topics::process_exited("swift-cove"), &serde_json::json!({"code": 0}));
//!
//! // In async context:
//! // let event = rx.recv().await.unwrap();
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Slow subscribers start lagging once this many events are buffered.
const DEFAULT_CAPACITY: usize = 1024;

/// Event type names.
///
/// Topics are colon separated so subscribers can filter with patterns like
/// `process:exited:*`.
pub mod topics {
    pub const CAPABILITIES_CHANGED: &str = "capabilities:changed";

    pub fn process_spawned(id: &str) -> String {
        format!("process:spawned:{id}")
    }

    pub fn process_backgrounded(id: &str) -> String {
        format!("process:backgrounded:{id}")
    }

    pub fn process_exited(id: &str) -> String {
        format!("process:exited:{id}")
    }

    pub fn process_removed(id: &str) -> String {
        format!("process:removed:{id}")
    }

    pub fn approval_requested(id: &str) -> String {
        format!("approval:requested:{id}")
    }

    pub fn approval_resolved(id: &str) -> String {
        format!("approval:resolved:{id}")
    }
}

/// A broadcast event containing an event type and JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl BroadcastEvent {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Publish-subscribe bus backed by a tokio broadcast channel.
pub struct EventBus {
    sender: broadcast::Sender<BroadcastEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns the number of subscribers that received it; with no
    /// subscribers the event is dropped and 0 is returned.
    pub fn emit<T: Serialize>(&self, event_type: &str, payload: &T) -> usize {
        let json_payload = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Failed to serialize payload for {}: {}", event_type, e);
                return 0;
            }
        };

        self.emit_raw(BroadcastEvent::new(event_type, json_payload))
    }

    pub fn emit_raw(&self, event: BroadcastEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Receive all future events. Past events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
