//! Per-connection delivery failures.
//!
//! Delivery failures never propagate to `send`/`broadcast` callers; they are
//! reported per connection so the caller can prune the dead one.

use thiserror::Error;

/// Why a single write to a connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The host transport's writer has gone away.
    #[error("connection closed")]
    ConnectionClosed,
    /// The outbound queue is full; the client is not draining it.
    #[error("outbound queue full")]
    QueueFull,
    /// The connection was already removed from the registry.
    #[error("connection already removed")]
    Removed,
}

impl DeliveryError {
    /// Short label used in logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            Self::ConnectionClosed => "closed",
            Self::QueueFull => "queue_full",
            Self::Removed => "removed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(DeliveryError::ConnectionClosed.to_string(), "connection closed");
        assert_eq!(DeliveryError::QueueFull.to_string(), "outbound queue full");
    }

    #[test]
    fn labels_are_snake_case() {
        for err in [
            DeliveryError::ConnectionClosed,
            DeliveryError::QueueFull,
            DeliveryError::Removed,
        ] {
            assert!(err.label().chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }
}
