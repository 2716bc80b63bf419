//! Event delivery: connection registry, replay window, and the two
//! interchangeable delivery strategies.
//!
//! A process picks one [`DeliveryService`] at start-up from
//! [`DeliveryStrategy`]: [`LocalDelivery`] reaches only connections held by
//! this process, [`DistributedDelivery`] adds cross-process fan-out on top.
//! Neither ever surfaces a per-connection or publish failure to its caller.

pub mod connection;
pub mod distributed;
pub mod local;
pub mod registry;
pub mod replay;
pub mod stream;
pub mod sweep;

use std::sync::Arc;

use async_trait::async_trait;
use herald_core::{Event, EventId, ReceiverId};
use herald_settings::DeliveryStrategy;
use serde_json::Value;

pub use connection::{Connection, ConnectionState, DeliveryOutcome, Termination};
pub use distributed::DistributedDelivery;
pub use local::{LocalDelivery, LocalOptions};
pub use registry::ConnectionRegistry;
pub use replay::ReplayBuffer;
pub use stream::EventStream;
pub use sweep::{SweepScheduler, SweepSchedule};

/// What one `send`/`broadcast` did locally.
#[derive(Clone, Debug)]
pub struct DeliveryReport {
    /// The event as created (and stored for replay).
    pub event: Arc<Event>,
    /// Local connections a write was attempted on.
    pub attempted: usize,
    /// Writes that succeeded.
    pub delivered: usize,
    /// Connections pruned because their write failed.
    pub pruned: usize,
}

impl DeliveryReport {
    pub(crate) fn new(event: Arc<Event>) -> Self {
        Self {
            event,
            attempted: 0,
            delivered: 0,
            pruned: 0,
        }
    }
}

/// What one liveness sweep did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Connections probed.
    pub probed: usize,
    /// Connections pruned because the probe failed.
    pub pruned: usize,
}

/// Public delivery contract used by the HTTP surface and business code.
#[async_trait]
pub trait DeliveryService: Send + Sync {
    /// Register a new connection for `receiver_id`.
    ///
    /// The stream starts with a `connected` event, followed by every replay
    /// window entry after `last_event_id` when one is given. Replay stops at
    /// the first failed write; live delivery continues regardless.
    fn connect(&self, receiver_id: ReceiverId, last_event_id: Option<EventId>) -> EventStream;

    /// Create an event and deliver it to every connection of `receiver_ids`.
    async fn send(
        &self,
        receiver_ids: &[ReceiverId],
        event_name: &str,
        payload: Value,
    ) -> DeliveryReport;

    /// Create an event and deliver it to every connection.
    async fn broadcast(&self, event_name: &str, payload: Value) -> DeliveryReport;

    /// Probe every connection with a `heartbeat` event, pruning dead ones.
    fn heartbeat(&self) -> SweepReport;

    /// Probe every connection with a `ping` event, pruning dead ones.
    fn cleanup(&self) -> SweepReport;

    /// This process's connections.
    fn registry(&self) -> &Arc<ConnectionRegistry>;

    /// Which strategy this is.
    fn strategy(&self) -> DeliveryStrategy;
}
