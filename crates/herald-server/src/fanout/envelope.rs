//! Wire envelope carried on both fan-out addresses.

use chrono::{DateTime, Utc};
use herald_core::{Event, EventId, ProcessId, ReceiverId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::FanoutAddress;

/// One event on its way to peer processes.
///
/// `targetUsers: null` marks a broadcast. `eventId` is optional on the wire;
/// when present, peers reuse it so the event carries one id everywhere.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutMessage {
    /// Receivers to reach, or `None` for every connection.
    pub target_users: Option<Vec<ReceiverId>>,
    /// Event name.
    pub event_name: String,
    /// Event payload.
    pub data: Value,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Process that published the envelope.
    pub origin_process_id: ProcessId,
    /// Id the origin stamped on the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
}

impl FanoutMessage {
    /// Envelope for a targeted `send`.
    pub fn targeted(event: &Event, targets: &[ReceiverId], origin: &ProcessId) -> Self {
        Self::from_event(event, Some(targets.to_vec()), origin)
    }

    /// Envelope for a `broadcast`.
    pub fn broadcast(event: &Event, origin: &ProcessId) -> Self {
        Self::from_event(event, None, origin)
    }

    fn from_event(event: &Event, target_users: Option<Vec<ReceiverId>>, origin: &ProcessId) -> Self {
        Self {
            target_users,
            event_name: event.name.clone(),
            data: event.payload.clone(),
            timestamp: Utc::now(),
            origin_process_id: origin.clone(),
            event_id: Some(event.id.clone()),
        }
    }

    /// Address this envelope belongs on.
    pub fn address(&self) -> FanoutAddress {
        if self.target_users.is_some() {
            FanoutAddress::Targeted
        } else {
            FanoutAddress::Broadcast
        }
    }

    /// Encode as JSON text.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode JSON text.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
