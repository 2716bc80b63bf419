//! Structured logging with `tracing`.
//!
//! Delivery context (receiver id, connection id, event name, fan-out address)
//! travels as structured fields on events and spans. [`init_subscriber`] is
//! called once by the binary; libraries only emit.

pub mod test_utils;

pub use test_utils::{CapturedLogs, capture_logs};

/// Initialize the global tracing subscriber on stderr.
///
/// `RUST_LOG` takes precedence over `level` when set. With `json` the output
/// is one JSON object per line, otherwise the compact human format.
/// Subsequent calls are no-ops.
pub fn init_subscriber(level: &str, json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails only when a global subscriber already exists
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.compact().try_init()
    };
}
