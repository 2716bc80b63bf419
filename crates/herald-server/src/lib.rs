//! # herald-server
//!
//! Real-time event delivery for Herald.
//!
//! - [`delivery`]: connection registry, replay window, the local and
//!   distributed strategies, and the liveness sweeps
//! - [`fanout`]: cross-process transport (Redis pub/sub or in-memory), the
//!   inbound bridge, and the optional event log
//! - [`server`] / [`sse`]: the axum surface (`/events`, `/health`, `/metrics`)
//! - [`wiring`]: builds and starts a strategy from settings
//! - [`shutdown`]: cancellation and task draining

#![deny(unsafe_code)]

pub mod delivery;
pub mod fanout;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod sse;
pub mod wiring;

pub use delivery::{
    ConnectionRegistry, DeliveryReport, DeliveryService, DistributedDelivery, EventStream,
    LocalDelivery, LocalOptions, ReplayBuffer, SweepReport, SweepScheduler,
};
pub use fanout::{FanoutAddress, FanoutBridge, FanoutMessage, FanoutTransport, MemoryFanout};
pub use server::{AppState, HeraldServer};
pub use shutdown::ShutdownCoordinator;
pub use wiring::DeliveryRuntime;
