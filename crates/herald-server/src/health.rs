//! `/health` endpoint body.

use std::time::Instant;

use herald_settings::DeliveryStrategy;
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while the server runs.
    pub status: &'static str,
    /// Seconds since start-up.
    pub uptime_secs: u64,
    /// Open event streams in this process.
    pub connections: usize,
    /// Receivers with at least one open stream.
    pub receivers: usize,
    /// Active delivery strategy.
    pub strategy: DeliveryStrategy,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    connections: usize,
    receivers: usize,
    strategy: DeliveryStrategy,
) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        receivers,
        strategy,
    }
}
