//! Settings schema.
//!
//! Every struct uses `#[serde(default)]` so a partial settings file only needs
//! the keys it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeraldSettings {
    /// HTTP listener.
    pub server: ServerSettings,
    /// Connection, replay and sweep behaviour.
    pub delivery: DeliverySettings,
    /// Cross-process fan-out.
    pub fanout: FanoutSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl HeraldSettings {
    /// Reject values the delivery layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_connections == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxConnections must be greater than zero".into(),
            ));
        }
        if self.delivery.replay_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "delivery.replayCapacity must be greater than zero".into(),
            ));
        }
        if self.delivery.outbound_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "delivery.outboundQueueCapacity must be greater than zero".into(),
            ));
        }
        if self.delivery.heartbeat_interval_ms == 0 || self.delivery.cleanup_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "sweep intervals must be greater than zero".into(),
            ));
        }
        if self.fanout.publish_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "fanout.publishTimeoutMs must be greater than zero".into(),
            ));
        }
        if self.fanout.log_poll_block_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "fanout.logPollBlockMs must be greater than zero".into(),
            ));
        }
        if self.delivery.strategy == DeliveryStrategy::Distributed
            && self.fanout.redis_url.trim().is_empty()
        {
            return Err(SettingsError::InvalidValue(
                "fanout.redisUrl is required for the distributed strategy".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` auto-assigns).
    pub port: u16,
    /// Maximum concurrent event streams held by this process.
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            max_connections: 10_000,
        }
    }
}

/// Which delivery strategy a process runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStrategy {
    /// Single process; only local connections are reachable.
    #[default]
    Local,
    /// Local delivery plus cross-process fan-out.
    Distributed,
}

/// Connection, replay and sweep settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    /// Local or distributed fan-out.
    pub strategy: DeliveryStrategy,
    /// Events kept for reconnect replay.
    pub replay_capacity: usize,
    /// Per-connection outbound queue; a full queue counts as a failed write.
    ///
    /// Also the largest burst one connection absorbs: a client that has not
    /// drained its stream is pruned once more than this many events are
    /// queued for it back to back.
    pub outbound_queue_capacity: usize,
    /// Heartbeat probe interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Cleanup probe interval in milliseconds.
    pub cleanup_interval_ms: u64,
    /// Lifetime of one event stream before it times out, in milliseconds.
    pub connection_timeout_ms: u64,
}

impl DeliverySettings {
    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Cleanup interval as a `Duration`.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Stream lifetime as a `Duration`.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            strategy: DeliveryStrategy::Local,
            replay_capacity: 1000,
            outbound_queue_capacity: 256,
            heartbeat_interval_ms: 30_000,
            cleanup_interval_ms: 900_000,
            connection_timeout_ms: 1_800_000,
        }
    }
}

/// Cross-process fan-out settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FanoutSettings {
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix for the `broadcast` / `targeted` pub/sub channels.
    pub channel_prefix: String,
    /// Upper bound on one publish, in milliseconds.
    pub publish_timeout_ms: u64,
    /// Event names carried by the log bridge instead of pub/sub.
    pub log_kinds: Vec<String>,
    /// Redis stream key used by the log bridge.
    pub log_stream_key: String,
    /// Approximate maximum length of the log stream.
    pub log_max_len: usize,
    /// How long one log read blocks waiting for entries, in milliseconds.
    pub log_poll_block_ms: u64,
}

impl FanoutSettings {
    /// Publish timeout as a `Duration`.
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            channel_prefix: "herald".to_string(),
            publish_timeout_ms: 2_000,
            log_kinds: Vec::new(),
            log_stream_key: "herald:events".to_string(),
            log_max_len: 10_000,
            log_poll_block_ms: 5_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = HeraldSettings::default();
        assert_eq!(s.delivery.strategy, DeliveryStrategy::Local);
        assert_eq!(s.delivery.replay_capacity, 1000);
        assert_eq!(s.delivery.outbound_queue_capacity, 256);
        assert_eq!(s.delivery.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(s.delivery.cleanup_interval(), Duration::from_secs(15 * 60));
        assert_eq!(s.fanout.channel_prefix, "herald");
        assert!(s.fanout.log_kinds.is_empty());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(HeraldSettings::default()).unwrap();
        assert!(json["delivery"].get("replayCapacity").is_some());
        assert!(json["fanout"].get("redisUrl").is_some());
        assert_eq!(json["delivery"]["strategy"], "local");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: HeraldSettings =
            serde_json::from_str(r#"{"delivery":{"strategy":"distributed"}}"#).unwrap();
        assert_eq!(s.delivery.strategy, DeliveryStrategy::Distributed);
        assert_eq!(s.delivery.replay_capacity, 1000);
        assert_eq!(s.server.port, 8090);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut s = HeraldSettings::default();
        s.delivery.replay_capacity = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn zero_fanout_timings_are_rejected() {
        let mut s = HeraldSettings::default();
        s.fanout.log_poll_block_ms = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));

        let mut s = HeraldSettings::default();
        s.fanout.publish_timeout_ms = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let mut s = HeraldSettings::default();
        s.server.max_connections = 0;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn distributed_requires_redis_url() {
        let mut s = HeraldSettings::default();
        s.delivery.strategy = DeliveryStrategy::Distributed;
        s.fanout.redis_url = "  ".into();
        assert!(s.validate().is_err());
    }
}
