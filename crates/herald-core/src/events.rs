//! Events pushed to client streams.
//!
//! An [`Event`] is created once by `send`/`broadcast` and never mutated. The
//! client-visible item is `{id, name, data}`; `created_at` stays server-side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConnectionId, EventId};

/// First event written to every new connection.
pub const CONNECTED: &str = "connected";
/// Periodic liveness probe sent by the heartbeat sweep.
pub const HEARTBEAT: &str = "heartbeat";
/// Coarse liveness probe sent by the cleanup sweep.
pub const PING: &str = "ping";

/// Whether `name` is reserved for the delivery layer itself.
pub fn is_reserved(name: &str) -> bool {
    matches!(name, CONNECTED | HEARTBEAT | PING)
}

/// An immutable event addressed to one or more receivers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique id used for replay correlation and client dedupe.
    pub id: EventId,
    /// Event name (e.g. `message.created`).
    pub name: String,
    /// Opaque payload.
    #[serde(rename = "data")]
    pub payload: Value,
    /// Creation time.
    #[serde(skip_serializing, default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Create an event with a freshly allocated id.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self::with_id(EventId::new(), name, payload)
    }

    /// Create an event that reuses an id allocated elsewhere (e.g. by a peer process).
    pub fn with_id(id: EventId, name: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            name: name.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// The `connected` acknowledgement for a new connection.
    pub fn connected(connection_id: &ConnectionId) -> Self {
        Self::new(
            CONNECTED,
            serde_json::json!({ "connectionId": connection_id }),
        )
    }

    /// A liveness probe (`heartbeat` or `ping`); the payload is ignorable.
    pub fn probe(name: &'static str) -> Self {
        Self::new(name, serde_json::json!({ "ts": Utc::now().timestamp_millis() }))
    }

    /// Payload serialized as JSON text, as written on the wire.
    pub fn data_json(&self) -> String {
        self.payload.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_names() {
        assert!(is_reserved("connected"));
        assert!(is_reserved("heartbeat"));
        assert!(is_reserved("ping"));
        assert!(!is_reserved("message.created"));
    }

    #[test]
    fn new_event_gets_fresh_id() {
        let a = Event::new("message.created", Value::Null);
        let b = Event::new("message.created", Value::Null);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn wire_shape_is_id_name_data() {
        let event = Event::with_id(
            EventId::from("evt_1"),
            "presence.changed",
            serde_json::json!({"status": "away"}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["id"], "evt_1");
        assert_eq!(json["name"], "presence.changed");
        assert_eq!(json["data"]["status"], "away");
        assert!(json.get("createdAt").is_none());
    }

    #[test]
    fn connected_event_carries_connection_id() {
        let event = Event::connected(&ConnectionId::from("c1"));
        assert_eq!(event.name, CONNECTED);
        assert_eq!(event.payload["connectionId"], "c1");
    }

    #[test]
    fn probe_uses_given_name() {
        assert_eq!(Event::probe(HEARTBEAT).name, "heartbeat");
        assert_eq!(Event::probe(PING).name, "ping");
    }

    #[test]
    fn data_json_is_compact() {
        let event = Event::new("x", serde_json::json!({"a": 1}));
        assert_eq!(event.data_json(), r#"{"a":1}"#);
    }
}
