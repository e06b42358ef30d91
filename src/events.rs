// SPDX-License-Identifier: MIT
//! In-process pub/sub used by lifecycle, auth, and billing to emit
//! observable events. Subscribers (SSE log bridges, cache invalidation,
//! notification fan-out behind the abstract bus boundary) receive every
//! event and filter by kind.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// One control-plane event. `kind` is a dotted name such as
/// `node.termination_warning` or `key.revoked`; `payload` is kind-specific.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: String,
    pub at: DateTime<Utc>,
    pub payload: Value,
}

/// Broadcasts events to all subscribers. Cheaply cloneable.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Publish an event to all subscribers. No subscribers is fine.
    pub fn publish(&self, kind: &str, payload: Value) {
        let _ = self.tx.send(Event {
            kind: kind.to_string(),
            at: Utc::now(),
            payload,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

// Event kind names used across the control plane. Centralised so emitters
// and subscribers cannot drift apart on spelling.
pub mod kind {
    pub const NODE_REGISTERED: &str = "node.registered";
    pub const NODE_STATUS_CHANGED: &str = "node.status_changed";
    pub const NODE_TERMINATION_WARNING: &str = "node.termination_warning";
    pub const NODE_LAUNCH_LOG: &str = "node.launch_log";
    pub const KEY_REVOKED: &str = "key.revoked";
    pub const BILLING_EXPORTED: &str = "billing.exported";
    pub const BILLING_EXPORT_FAILED: &str = "billing.export_failed";
    pub const BILLING_RECONCILIATION_ALERT: &str = "billing.reconciliation_alert";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(kind::NODE_REGISTERED, json!({ "node_id": "n1" }));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, kind::NODE_REGISTERED);
        assert_eq!(event.payload["node_id"], "n1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(kind::KEY_REVOKED, json!({ "key_id": "k" }));
    }
}
