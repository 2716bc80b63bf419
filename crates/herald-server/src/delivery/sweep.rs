//! Periodic liveness sweeps.
//!
//! The heartbeat sweep runs often and reclaims half-dead connections the
//! transport has not reported closed yet; the cleanup sweep runs rarely as a
//! coarser safety net. Both run on their own schedule, off the request path.

use std::sync::Arc;
use std::time::Duration;

use herald_settings::DeliverySettings;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::DeliveryService;

/// Sweep intervals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SweepSchedule {
    /// Time between heartbeat sweeps.
    pub heartbeat_interval: Duration,
    /// Time between cleanup sweeps.
    pub cleanup_interval: Duration,
}

impl From<&DeliverySettings> for SweepSchedule {
    fn from(settings: &DeliverySettings) -> Self {
        Self {
            heartbeat_interval: settings.heartbeat_interval(),
            cleanup_interval: settings.cleanup_interval(),
        }
    }
}

impl Default for SweepSchedule {
    fn default() -> Self {
        Self::from(&DeliverySettings::default())
    }
}

/// Drives `heartbeat` and `cleanup` on a delivery service.
pub struct SweepScheduler {
    service: Arc<dyn DeliveryService>,
    schedule: SweepSchedule,
}

impl SweepScheduler {
    /// Create a scheduler for `service`.
    pub fn new(service: Arc<dyn DeliveryService>, schedule: SweepSchedule) -> Self {
        Self { service, schedule }
    }

    /// Spawn [`SweepScheduler::run`] onto the runtime.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Sweep until `cancel` fires. The first sweep of each kind happens one
    /// interval after start.
    pub async fn run(self, cancel: CancellationToken) {
        let start = Instant::now();
        let mut heartbeat = time::interval_at(
            start + self.schedule.heartbeat_interval,
            self.schedule.heartbeat_interval,
        );
        let mut cleanup = time::interval_at(
            start + self.schedule.cleanup_interval,
            self.schedule.cleanup_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            heartbeat_secs = self.schedule.heartbeat_interval.as_secs(),
            cleanup_secs = self.schedule.cleanup_interval.as_secs(),
            "sweep scheduler started"
        );

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let report = self.service.heartbeat();
                    debug!(sweep = "heartbeat", probed = report.probed, pruned = report.pruned, "sweep finished");
                }
                _ = cleanup.tick() => {
                    let report = self.service.cleanup();
                    info!(sweep = "cleanup", probed = report.probed, pruned = report.pruned, "sweep finished");
                }
                () = cancel.cancelled() => break,
            }
        }
        info!("sweep scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{LocalDelivery, LocalOptions};
    use herald_core::ReceiverId;
    use herald_core::events::{HEARTBEAT, PING};

    fn service() -> Arc<LocalDelivery> {
        Arc::new(LocalDelivery::new(LocalOptions {
            replay_capacity: 16,
            queue_capacity: 64,
            connection_timeout: None,
        }))
    }

    fn schedule() -> SweepSchedule {
        SweepSchedule {
            heartbeat_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(900),
        }
    }

    #[test]
    fn default_schedule_matches_settings() {
        let s = SweepSchedule::default();
        assert_eq!(s.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(s.cleanup_interval, Duration::from_secs(900));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_arrive_on_schedule() {
        let svc = service();
        let mut stream = svc.connect(ReceiverId::from("alice"), None);
        let _ = stream.try_recv();

        let cancel = CancellationToken::new();
        let handle = SweepScheduler::new(svc.clone(), schedule()).spawn(cancel.clone());

        // nothing before the first interval
        time::sleep(Duration::from_secs(29)).await;
        assert!(stream.try_recv().is_none());

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(stream.try_recv().unwrap().name, HEARTBEAT);

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(stream.try_recv().unwrap().name, HEARTBEAT);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_runs_on_its_own_cadence() {
        let svc = service();
        let mut stream = svc.connect(ReceiverId::from("alice"), None);
        let _ = stream.try_recv();

        let cancel = CancellationToken::new();
        let handle = SweepScheduler::new(svc.clone(), schedule()).spawn(cancel.clone());

        time::sleep(Duration::from_secs(901)).await;
        let names: Vec<_> = std::iter::from_fn(|| stream.try_recv())
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(names.iter().filter(|n| n.as_str() == HEARTBEAT).count(), 30);
        assert_eq!(names.iter().filter(|n| n.as_str() == PING).count(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = SweepScheduler::new(service(), schedule()).spawn(cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
