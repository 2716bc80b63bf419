//! A single client stream held by this process.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use herald_core::{ConnectionId, DeliveryError, Event, ReceiverId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Lifecycle of a connection.
///
/// `Created → Open → {Completed | TimedOut | Errored} → Removed`. `Removed`
/// is terminal; a removed connection never accepts another write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, not yet registered.
    Created,
    /// Registered and accepting writes.
    Open,
    /// The client or host closed the stream normally.
    Completed,
    /// The stream outlived its configured lifetime.
    TimedOut,
    /// A write failed or the host reported an error.
    Errored,
    /// Deregistered.
    Removed,
}

impl ConnectionState {
    /// Whether the connection can no longer accept writes.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Created | Self::Open)
    }
}

/// Terminal signal reported by the host transport or by a failed write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// Normal close.
    Completed,
    /// Stream lifetime exceeded.
    TimedOut,
    /// Transport error or failed write.
    Errored,
}

impl Termination {
    fn state(self) -> ConnectionState {
        match self {
            Self::Completed => ConnectionState::Completed,
            Self::TimedOut => ConnectionState::TimedOut,
            Self::Errored => ConnectionState::Errored,
        }
    }

    /// Short label used in logs and metrics.
    pub fn label(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Errored => "errored",
        }
    }
}

/// Result of one write attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The event was queued for the client.
    Delivered,
    /// The write failed; the connection should be pruned.
    Failed(DeliveryError),
}

impl DeliveryOutcome {
    /// Whether the write succeeded.
    pub fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered)
    }
}

struct Inner {
    state: ConnectionState,
    tx: Option<mpsc::Sender<Arc<Event>>>,
}

/// An open client stream.
///
/// Writes go into a bounded queue drained by the host transport's writer, so
/// a producer never waits on a slow client: a full or closed queue is a
/// failed write.
pub struct Connection {
    id: ConnectionId,
    receiver_id: ReceiverId,
    connected_at: Instant,
    inner: Mutex<Inner>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Connection {
    /// Create a connection feeding `tx`.
    pub fn new(receiver_id: ReceiverId, tx: mpsc::Sender<Arc<Event>>) -> Self {
        Self {
            id: ConnectionId::new(),
            receiver_id,
            connected_at: Instant::now(),
            inner: Mutex::new(Inner {
                state: ConnectionState::Created,
                tx: Some(tx),
            }),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Receiver this connection belongs to.
    pub fn receiver_id(&self) -> &ReceiverId {
        &self.receiver_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Time since the connection was created.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Events successfully queued so far.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Failed write attempts so far.
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// `Created → Open`. No effect in any other state.
    pub fn open(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Created {
            inner.state = ConnectionState::Open;
        }
    }

    /// Queue `event` for the client without waiting.
    pub fn deliver(&self, event: &Arc<Event>) -> DeliveryOutcome {
        let inner = self.inner.lock();
        let outcome = match (&inner.tx, inner.state.is_terminal()) {
            (Some(tx), false) => match tx.try_send(Arc::clone(event)) {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(TrySendError::Full(_)) => DeliveryOutcome::Failed(DeliveryError::QueueFull),
                Err(TrySendError::Closed(_)) => {
                    DeliveryOutcome::Failed(DeliveryError::ConnectionClosed)
                }
            },
            _ => DeliveryOutcome::Failed(DeliveryError::Removed),
        };
        drop(inner);

        let counter = if outcome.is_delivered() {
            &self.delivered
        } else {
            &self.failed
        };
        let _ = counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// Record a terminal signal. Returns `false` if one was already recorded.
    pub fn terminate(&self, termination: Termination) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = termination.state();
        true
    }

    /// Final transition to `Removed`; drops the sender so the client stream
    /// ends once its queue drains.
    pub fn mark_removed(&self) {
        let mut inner = self.inner.lock();
        inner.state = ConnectionState::Removed;
        inner.tx = None;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("receiver_id", &self.receiver_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
