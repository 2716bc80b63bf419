//! # herald-core
//!
//! Foundation types shared by every Herald crate.
//!
//! - [`ids`]: branded ID newtypes (`EventId`, `ReceiverId`, `ConnectionId`, `ProcessId`)
//! - [`events`]: the immutable [`events::Event`] and the reserved event names
//! - [`errors`]: per-connection delivery failures
//! - [`logging`]: `tracing` subscriber setup and a log-capture helper for tests

#![deny(unsafe_code)]

pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;

pub use errors::DeliveryError;
pub use events::Event;
pub use ids::{ConnectionId, EventId, ProcessId, ReceiverId};
