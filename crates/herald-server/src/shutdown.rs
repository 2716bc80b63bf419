//! Graceful shutdown of background delivery tasks.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default drain window before remaining tasks are abandoned.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the process-wide cancellation token and the background tasks
/// (sweeps, bridges, listener) that must stop with it.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no tracked tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// A child token; cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Track a task to drain on shutdown.
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Track several tasks.
    pub fn track_all(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.tasks.lock().extend(handles);
    }

    /// Tasks currently tracked.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Signal shutdown without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, then wait up to `timeout` for every tracked task; tasks still
    /// running afterwards are aborted. Returns whether all finished in time.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();

        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        info!(
            task_count = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "draining background tasks"
        );

        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(?timeout, "shutdown drain timed out, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
            return false;
        }
        info!("background tasks stopped");
        true
    }
}
