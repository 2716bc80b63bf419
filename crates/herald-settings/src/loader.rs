//! Settings loading: compiled defaults, then the JSON file deep-merged over
//! them, then `HERALD_*` environment overrides.
//!
//! Deep merge rules:
//! - Objects merge recursively (source wins per key)
//! - Arrays and primitives are replaced by the source
//! - `null` in the source keeps the target value

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{DeliveryStrategy, HeraldSettings};

/// Default settings file (`~/.herald/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".herald").join("settings.json")
}

/// Load from the default path with env overrides.
pub fn load_settings() -> Result<HeraldSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with env overrides, then validate.
///
/// A missing file yields defaults; an unreadable or malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<HeraldSettings> {
    let defaults = serde_json::to_value(HeraldSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: HeraldSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `HERALD_*` overrides read through `lookup`.
///
/// Out-of-range or unparsable values are logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut HeraldSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("HERALD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64_in("HERALD_PORT", 0, 65_535) {
        settings.server.port = u16::try_from(v).unwrap_or(settings.server.port);
    }
    if let Some(v) = env.u64_in("HERALD_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = usize::try_from(v).unwrap_or(usize::MAX);
    }

    if let Some(v) = env.string("HERALD_STRATEGY") {
        match parse_strategy(&v) {
            Some(strategy) => settings.delivery.strategy = strategy,
            None => tracing::warn!(key = "HERALD_STRATEGY", value = %v, "unknown strategy, ignoring"),
        }
    }
    if let Some(v) = env.u64_in("HERALD_REPLAY_CAPACITY", 1, 1_000_000) {
        settings.delivery.replay_capacity = usize::try_from(v).unwrap_or(usize::MAX);
    }
    if let Some(v) = env.u64_in("HERALD_QUEUE_CAPACITY", 1, 65_536) {
        settings.delivery.outbound_queue_capacity = usize::try_from(v).unwrap_or(usize::MAX);
    }
    if let Some(v) = env.u64_in("HERALD_HEARTBEAT_INTERVAL_MS", 1_000, 600_000) {
        settings.delivery.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.u64_in("HERALD_CLEANUP_INTERVAL_MS", 1_000, 86_400_000) {
        settings.delivery.cleanup_interval_ms = v;
    }
    if let Some(v) = env.u64_in("HERALD_CONNECTION_TIMEOUT_MS", 1_000, 86_400_000) {
        settings.delivery.connection_timeout_ms = v;
    }

    if let Some(v) = env.string("HERALD_REDIS_URL") {
        settings.fanout.redis_url = v;
    }
    if let Some(v) = env.string("HERALD_CHANNEL_PREFIX") {
        settings.fanout.channel_prefix = v;
    }
    if let Some(v) = env.string("HERALD_LOG_KINDS") {
        settings.fanout.log_kinds = split_list(&v);
    }

    if let Some(v) = env.string("HERALD_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("HERALD_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a boolean: `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a `u64` within `[min, max]`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

/// Parse a strategy name (case-insensitive).
pub fn parse_strategy(val: &str) -> Option<DeliveryStrategy> {
    match val.trim().to_lowercase().as_str() {
        "local" => Some(DeliveryStrategy::Local),
        "distributed" | "redis" => Some(DeliveryStrategy::Distributed),
        _ => None,
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let parsed = parse_bool(&val);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        parsed
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let parsed = parse_u64_range(&val, min, max);
        if parsed.is_none() {
            tracing::warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        parsed
    }
}
