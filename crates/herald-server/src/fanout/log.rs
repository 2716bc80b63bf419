//! Cross-transport bridge: selected event kinds travel through an
//! append-only log instead of pub/sub.
//!
//! Systems that already run a log or topic bus can carry, say,
//! `message.created` there. Every process tails the log from where it stood
//! at start-up and redelivers entries to its own connections.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use herald_core::ProcessId;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::FanoutError;
use super::bridge::{BridgeOutcome, redeliver};
use crate::delivery::LocalDelivery;

/// Cursor that precedes every entry.
pub const LOG_START: &str = "0";

/// Delay before retrying after a failed read.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Shortest wait one tailing read may use; a zero wait would spin.
pub const MIN_POLL_BLOCK: Duration = Duration::from_millis(10);

/// One log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    /// Position of the entry; pass it to `read_after` to continue.
    pub cursor: String,
    /// Encoded envelope.
    pub payload: String,
}

/// Append-only envelope log shared by every process.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append an encoded envelope; returns its cursor.
    async fn append(&self, payload: String) -> Result<String, FanoutError>;

    /// Up to `limit` entries after `cursor`, waiting up to `block` when there
    /// are none yet. An empty result means the wait elapsed.
    async fn read_after(
        &self,
        cursor: &str,
        block: Duration,
        limit: usize,
    ) -> Result<Vec<LogEntry>, FanoutError>;

    /// Cursor of the newest entry, or [`LOG_START`] when empty.
    async fn head(&self) -> Result<String, FanoutError>;

    /// Log name for diagnostics.
    fn name(&self) -> &'static str;
}

/// In-process log, trimmed to `max_len` entries.
#[derive(Clone)]
pub struct MemoryEventLog {
    inner: Arc<MemoryLogInner>,
}

struct MemoryLogInner {
    max_len: usize,
    entries: Mutex<VecDeque<(u64, String)>>,
    head: watch::Sender<u64>,
}

impl MemoryEventLog {
    /// Create a log keeping at most `max_len` entries.
    pub fn new(max_len: usize) -> Self {
        let (head, _) = watch::channel(0);
        Self {
            inner: Arc::new(MemoryLogInner {
                max_len: max_len.max(1),
                entries: Mutex::new(VecDeque::new()),
                head,
            }),
        }
    }

    /// Entries currently held.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    fn collect_after(&self, after: u64, limit: usize) -> Vec<LogEntry> {
        self.inner
            .entries
            .lock()
            .iter()
            .filter(|(seq, _)| *seq > after)
            .take(limit)
            .map(|(seq, payload)| LogEntry {
                cursor: seq.to_string(),
                payload: payload.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, payload: String) -> Result<String, FanoutError> {
        let seq = {
            let mut entries = self.inner.entries.lock();
            let seq = *self.inner.head.borrow() + 1;
            entries.push_back((seq, payload));
            while entries.len() > self.inner.max_len {
                let _ = entries.pop_front();
            }
            let _ = self.inner.head.send_replace(seq);
            seq
        };
        Ok(seq.to_string())
    }

    async fn read_after(
        &self,
        cursor: &str,
        block: Duration,
        limit: usize,
    ) -> Result<Vec<LogEntry>, FanoutError> {
        let after: u64 = cursor
            .parse()
            .map_err(|_| FanoutError::Log(format!("invalid cursor {cursor:?}")))?;
        // subscribe before checking so an append in between still wakes us
        let mut head = self.inner.head.subscribe();
        let entries = self.collect_after(after, limit);
        if !entries.is_empty() || block.is_zero() {
            return Ok(entries);
        }
        if tokio::time::timeout(block, head.changed()).await.is_err() {
            return Ok(Vec::new());
        }
        Ok(self.collect_after(after, limit))
    }

    async fn head(&self) -> Result<String, FanoutError> {
        Ok(self.inner.head.borrow().to_string())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Tails an [`EventLog`] and redelivers entries locally.
pub struct LogBridge {
    log: Arc<dyn EventLog>,
    local: Arc<LocalDelivery>,
    origin: ProcessId,
    block: Duration,
    batch: usize,
}

impl LogBridge {
    /// Create a bridge for the process identified by `origin`.
    ///
    /// `block` is raised to [`MIN_POLL_BLOCK`] when shorter.
    pub fn new(
        log: Arc<dyn EventLog>,
        local: Arc<LocalDelivery>,
        origin: ProcessId,
        block: Duration,
    ) -> Self {
        Self {
            log,
            local,
            origin,
            block: block.max(MIN_POLL_BLOCK),
            batch: 100,
        }
    }

    /// Handle one log entry.
    pub fn handle_entry(&self, payload: &str) -> BridgeOutcome {
        redeliver(&self.local, &self.origin, None, payload)
    }

    /// Current log head, retrying until it is known or `cancel` fires.
    pub async fn start_cursor(&self, cancel: &CancellationToken) -> Option<String> {
        loop {
            match self.log.head().await {
                Ok(cursor) => return Some(cursor),
                Err(error) => warn!(log = self.log.name(), %error, "event log head unavailable"),
            }
            tokio::select! {
                () = tokio::time::sleep(RETRY_DELAY) => {}
                () = cancel.cancelled() => return None,
            }
        }
    }

    /// Tail from the current head until `cancel` fires.
    #[tracing::instrument(skip_all, name = "log_bridge", fields(origin = %self.origin))]
    pub async fn run(self, cancel: CancellationToken) {
        let Some(cursor) = self.start_cursor(&cancel).await else {
            return;
        };
        self.run_from(cursor, cancel).await;
    }

    /// Tail from `cursor` until `cancel` fires.
    pub async fn run_from(self, mut cursor: String, cancel: CancellationToken) {
        info!(log = self.log.name(), %cursor, "log bridge tailing");
        loop {
            let read = tokio::select! {
                r = self.log.read_after(&cursor, self.block, self.batch) => r,
                () = cancel.cancelled() => break,
            };
            match read {
                Ok(entries) => {
                    for entry in entries {
                        let outcome = self.handle_entry(&entry.payload);
                        debug!(cursor = %entry.cursor, ?outcome, "log entry handled");
                        cursor = entry.cursor;
                    }
                }
                Err(error) => {
                    warn!(log = self.log.name(), %error, "event log read failed");
                    tokio::select! {
                        () = tokio::time::sleep(RETRY_DELAY) => {}
                        () = cancel.cancelled() => break,
                    }
                }
            }
        }
        info!("log bridge stopped");
    }
}
