//! Start-up wiring: settings in, a running delivery strategy out.

use std::sync::Arc;
use std::time::Duration;

use herald_core::ProcessId;
use herald_settings::{DeliveryStrategy, HeraldSettings};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::delivery::{
    DeliveryService, DistributedDelivery, LocalDelivery, LocalOptions, SweepSchedule,
    SweepScheduler,
};
use crate::fanout::{
    EventLog, FanoutBridge, FanoutError, FanoutTransport, LogBridge, RedisFanout, RedisStreamLog,
};

/// A delivery strategy plus the background work it needs.
///
/// Built once per process; [`DeliveryRuntime::start`] spawns the bridges and
/// sweeps and hands back the service for the HTTP layer.
pub struct DeliveryRuntime {
    service: Arc<dyn DeliveryService>,
    fanout_bridge: Option<FanoutBridge>,
    log_bridge: Option<LogBridge>,
    schedule: SweepSchedule,
}

impl DeliveryRuntime {
    /// Single-process delivery.
    pub fn local(settings: &HeraldSettings) -> Self {
        let local = LocalDelivery::new(LocalOptions::from(&settings.delivery));
        Self {
            service: Arc::new(local),
            fanout_bridge: None,
            log_bridge: None,
            schedule: SweepSchedule::from(&settings.delivery),
        }
    }

    /// Distributed delivery over `transport`, with `log` carrying the
    /// configured log kinds when given.
    pub fn distributed(
        settings: &HeraldSettings,
        transport: Arc<dyn FanoutTransport>,
        log: Option<Arc<dyn EventLog>>,
        origin: ProcessId,
    ) -> Self {
        let local = Arc::new(LocalDelivery::new(LocalOptions::from(&settings.delivery)));
        let mut service = DistributedDelivery::new(local, transport, origin)
            .with_publish_timeout(settings.fanout.publish_timeout());
        if let Some(log) = log {
            service = service.with_log(log, settings.fanout.log_kinds.iter().cloned());
        }

        let fanout_bridge = Some(service.bridge());
        let log_bridge =
            service.log_bridge(Duration::from_millis(settings.fanout.log_poll_block_ms));
        Self {
            service: Arc::new(service),
            fanout_bridge,
            log_bridge,
            schedule: SweepSchedule::from(&settings.delivery),
        }
    }

    /// Build the strategy `settings` select, connecting to Redis for the
    /// distributed one.
    pub async fn from_settings(settings: &HeraldSettings) -> Result<Self, FanoutError> {
        match settings.delivery.strategy {
            DeliveryStrategy::Local => Ok(Self::local(settings)),
            DeliveryStrategy::Distributed => {
                let fanout = &settings.fanout;
                let transport =
                    RedisFanout::connect(&fanout.redis_url, fanout.channel_prefix.clone()).await?;
                let log: Option<Arc<dyn EventLog>> = if fanout.log_kinds.is_empty() {
                    None
                } else {
                    let log = RedisStreamLog::connect(
                        &fanout.redis_url,
                        fanout.log_stream_key.clone(),
                        fanout.log_max_len,
                    )
                    .await?;
                    Some(Arc::new(log))
                };
                let origin = ProcessId::new();
                info!(%origin, log_kinds = fanout.log_kinds.len(), "distributed delivery configured");
                Ok(Self::distributed(settings, Arc::new(transport), log, origin))
            }
        }
    }

    /// The delivery service.
    pub fn service(&self) -> &Arc<dyn DeliveryService> {
        &self.service
    }

    /// Subscribe the bridges, then spawn them and the sweep scheduler.
    ///
    /// Subscriptions are live once this returns: envelopes peers publish
    /// afterwards reach this process.
    pub async fn start(
        self,
        cancel: CancellationToken,
    ) -> (Arc<dyn DeliveryService>, Vec<JoinHandle<()>>) {
        let mut tasks = Vec::new();

        if let Some(bridge) = self.fanout_bridge {
            let streams = bridge.subscribe().await;
            tasks.push(tokio::spawn(bridge.run_from(streams, cancel.clone())));
        }
        if let Some(bridge) = self.log_bridge {
            if let Some(cursor) = bridge.start_cursor(&cancel).await {
                tasks.push(tokio::spawn(bridge.run_from(cursor, cancel.clone())));
            }
        }
        tasks.push(SweepScheduler::new(Arc::clone(&self.service), self.schedule).spawn(cancel));

        info!(
            strategy = ?self.service.strategy(),
            tasks = tasks.len(),
            "delivery runtime started"
        );
        (self.service, tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::{MemoryEventLog, MemoryFanout};

    #[test]
    fn local_has_no_bridges() {
        let runtime = DeliveryRuntime::local(&HeraldSettings::default());
        assert!(runtime.fanout_bridge.is_none());
        assert!(runtime.log_bridge.is_none());
        assert_eq!(runtime.service().strategy(), DeliveryStrategy::Local);
    }

    #[test]
    fn distributed_log_bridge_follows_log_kinds() {
        let mut settings = HeraldSettings::default();
        let hub = Arc::new(MemoryFanout::new());
        let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new(10));

        let runtime = DeliveryRuntime::distributed(
            &settings,
            hub.clone(),
            Some(log.clone()),
            ProcessId::from("a"),
        );
        assert!(runtime.fanout_bridge.is_some());
        assert!(runtime.log_bridge.is_none());

        settings.fanout.log_kinds = vec!["message.created".into()];
        let runtime = DeliveryRuntime::distributed(&settings, hub, Some(log), ProcessId::from("a"));
        assert!(runtime.log_bridge.is_some());
        assert_eq!(runtime.service().strategy(), DeliveryStrategy::Distributed);
    }

    #[tokio::test]
    async fn local_from_settings_needs_no_redis() {
        let runtime = DeliveryRuntime::from_settings(&HeraldSettings::default())
            .await
            .unwrap();
        assert_eq!(runtime.service().strategy(), DeliveryStrategy::Local);
    }

    #[tokio::test]
    async fn start_spawns_bridge_and_sweeps() {
        let hub = MemoryFanout::new();
        let runtime = DeliveryRuntime::distributed(
            &HeraldSettings::default(),
            Arc::new(hub.clone()),
            None,
            ProcessId::from("a"),
        );
        let cancel = CancellationToken::new();
        let (_service, tasks) = runtime.start(cancel.clone()).await;
        assert_eq!(tasks.len(), 2);
        assert_eq!(hub.subscriber_count(crate::fanout::FanoutAddress::Broadcast), 1);

        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }
    }
}
