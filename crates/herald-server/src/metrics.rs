//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder and return the render handle.
///
/// Fails if a recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Connections opened (counter).
pub const CONNECTIONS_OPENED_TOTAL: &str = "herald_connections_opened_total";
/// Connections closed (counter, labels: reason).
pub const CONNECTIONS_CLOSED_TOTAL: &str = "herald_connections_closed_total";
/// Open connections in this process (gauge).
pub const CONNECTIONS_ACTIVE: &str = "herald_connections_active";
/// Connections rejected at the connection limit (counter).
pub const CONNECTIONS_REJECTED_TOTAL: &str = "herald_connections_rejected_total";
/// Events created by `send`/`broadcast` (counter, labels: kind).
pub const EVENTS_SENT_TOTAL: &str = "herald_events_sent_total";
/// Successful per-connection writes (counter).
pub const DELIVERIES_TOTAL: &str = "herald_deliveries_total";
/// Connections pruned after a failed write (counter, labels: error).
pub const CONNECTIONS_PRUNED_TOTAL: &str = "herald_connections_pruned_total";
/// Replayed events written on reconnect (counter).
pub const REPLAY_EVENTS_TOTAL: &str = "herald_replay_events_total";
/// Fan-out envelopes published (counter, labels: address).
pub const FANOUT_PUBLISHED_TOTAL: &str = "herald_fanout_published_total";
/// Fan-out publish failures (counter, labels: address).
pub const FANOUT_PUBLISH_FAILURES_TOTAL: &str = "herald_fanout_publish_failures_total";
/// Inbound fan-out envelopes redelivered locally (counter, labels: address).
pub const FANOUT_RECEIVED_TOTAL: &str = "herald_fanout_received_total";
/// Inbound fan-out envelopes dropped as malformed (counter, labels: address).
pub const FANOUT_DECODE_FAILURES_TOTAL: &str = "herald_fanout_decode_failures_total";
