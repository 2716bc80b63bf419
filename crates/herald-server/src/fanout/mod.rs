//! Cross-process fan-out.
//!
//! Every process publishes a [`FanoutMessage`] per `send`/`broadcast` on one
//! of two logical addresses and runs a [`FanoutBridge`] that redelivers
//! inbound envelopes to its own connections. Event kinds configured for the
//! [`EventLog`] travel through the log instead and are picked up by a
//! [`LogBridge`].

pub mod bridge;
pub mod envelope;
pub mod log;
pub mod memory;
pub mod redis_log;
pub mod redis_pubsub;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

pub use bridge::{BridgeOutcome, FanoutBridge, InboundStreams};
pub use envelope::FanoutMessage;
pub use log::{EventLog, LogBridge, LogEntry, MemoryEventLog};
pub use memory::MemoryFanout;
pub use redis_log::RedisStreamLog;
pub use redis_pubsub::RedisFanout;

/// Logical fan-out address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FanoutAddress {
    /// Envelopes for every connection on every process.
    Broadcast,
    /// Envelopes for a listed set of receivers.
    Targeted,
}

impl FanoutAddress {
    /// Both addresses, in subscription order.
    pub const ALL: [Self; 2] = [Self::Broadcast, Self::Targeted];

    /// Address name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Targeted => "targeted",
        }
    }

    /// Concrete channel name under `prefix` (`<prefix>:broadcast`).
    pub fn channel(self, prefix: &str) -> String {
        if prefix.is_empty() {
            self.as_str().to_string()
        } else {
            format!("{prefix}:{}", self.as_str())
        }
    }
}

impl fmt::Display for FanoutAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fan-out failures. None of them ever reaches a `send`/`broadcast` caller.
#[derive(Debug, Error)]
pub enum FanoutError {
    /// The transport rejected or could not carry a publish.
    #[error("publish to {address} failed: {reason}")]
    Publish {
        /// Target address.
        address: FanoutAddress,
        /// Transport-specific reason.
        reason: String,
    },
    /// Subscribing to an address failed.
    #[error("subscribe to {address} failed: {reason}")]
    Subscribe {
        /// Target address.
        address: FanoutAddress,
        /// Transport-specific reason.
        reason: String,
    },
    /// A publish did not complete in time.
    #[error("publish to {address} timed out")]
    Timeout {
        /// Target address.
        address: FanoutAddress,
    },
    /// An inbound envelope could not be decoded.
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),
    /// Redis error.
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    /// Event log failure.
    #[error("event log: {0}")]
    Log(String),
}

/// Pub/sub carrier for fan-out envelopes.
#[async_trait]
pub trait FanoutTransport: Send + Sync {
    /// Publish one encoded envelope on `address`.
    async fn publish(&self, address: FanoutAddress, payload: String) -> Result<(), FanoutError>;

    /// Subscribe to `address`. The stream ends when the subscription is lost.
    async fn subscribe(
        &self,
        address: FanoutAddress,
    ) -> Result<BoxStream<'static, String>, FanoutError>;

    /// Transport name for logs.
    fn name(&self) -> &'static str;
}
