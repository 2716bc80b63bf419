//! Multi-process delivery strategy: local delivery plus fan-out to peers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use herald_core::{EventId, ProcessId, ReceiverId};
use herald_settings::DeliveryStrategy;
use serde_json::Value;
use tracing::{debug, warn};

use super::local::LocalDelivery;
use super::registry::ConnectionRegistry;
use super::stream::EventStream;
use super::{DeliveryReport, DeliveryService, SweepReport};
use crate::fanout::{
    EventLog, FanoutAddress, FanoutBridge, FanoutError, FanoutMessage, FanoutTransport, LogBridge,
};
use crate::metrics::{FANOUT_PUBLISHED_TOTAL, FANOUT_PUBLISH_FAILURES_TOTAL};

/// Default bound on one publish.
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

struct LogRoute {
    log: Arc<dyn EventLog>,
    kinds: HashSet<String>,
}

/// Delivers locally, then hands the event to peer processes.
///
/// Publishing is best-effort: a failed or slow publish is logged and
/// counted, local delivery has already happened, and nothing is retried.
pub struct DistributedDelivery {
    local: Arc<LocalDelivery>,
    transport: Arc<dyn FanoutTransport>,
    log: Option<LogRoute>,
    origin: ProcessId,
    publish_timeout: Duration,
}

impl DistributedDelivery {
    /// Wrap `local`, publishing through `transport` as process `origin`.
    pub fn new(
        local: Arc<LocalDelivery>,
        transport: Arc<dyn FanoutTransport>,
        origin: ProcessId,
    ) -> Self {
        Self {
            local,
            transport,
            log: None,
            origin,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Bound each publish by `timeout`.
    #[must_use]
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Route the event names in `kinds` through `log` instead of pub/sub.
    #[must_use]
    pub fn with_log<I, S>(mut self, log: Arc<dyn EventLog>, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let kinds: HashSet<String> = kinds.into_iter().map(Into::into).collect();
        if !kinds.is_empty() {
            self.log = Some(LogRoute { log, kinds });
        }
        self
    }

    /// This process's id, stamped on every envelope.
    pub fn origin(&self) -> &ProcessId {
        &self.origin
    }

    /// The wrapped local strategy.
    pub fn local(&self) -> &Arc<LocalDelivery> {
        &self.local
    }

    /// Inbound bridge for this process's pub/sub subscriptions.
    pub fn bridge(&self) -> FanoutBridge {
        FanoutBridge::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.local),
            self.origin.clone(),
        )
    }

    /// Inbound bridge for the event log, when one is configured.
    pub fn log_bridge(&self, block: Duration) -> Option<LogBridge> {
        self.log.as_ref().map(|route| {
            LogBridge::new(
                Arc::clone(&route.log),
                Arc::clone(&self.local),
                self.origin.clone(),
                block,
            )
        })
    }

    /// Hand `message` to peers. Failures are logged, never returned.
    async fn publish(&self, message: FanoutMessage) {
        let address = message.address();
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(error) => {
                warn!(%address, %error, "fan-out envelope could not be encoded");
                return;
            }
        };

        let (route, result) = match &self.log {
            Some(route) if route.kinds.contains(&message.event_name) => (
                "log",
                self.bounded(address, route.log.append(payload)).await.map(drop),
            ),
            _ => (
                address.as_str(),
                self.bounded(address, self.transport.publish(address, payload)).await,
            ),
        };

        match result {
            Ok(()) => {
                metrics::counter!(FANOUT_PUBLISHED_TOTAL, "address" => route).increment(1);
                debug!(route, event_name = %message.event_name, "fan-out envelope published");
            }
            Err(error) => {
                metrics::counter!(FANOUT_PUBLISH_FAILURES_TOTAL, "address" => route).increment(1);
                warn!(
                    route,
                    transport = self.transport.name(),
                    event_name = %message.event_name,
                    %error,
                    "fan-out publish failed, peers will miss this event"
                );
            }
        }
    }

    async fn bounded<T, F>(&self, address: FanoutAddress, fut: F) -> Result<T, FanoutError>
    where
        F: Future<Output = Result<T, FanoutError>>,
    {
        match tokio::time::timeout(self.publish_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(FanoutError::Timeout { address }),
        }
    }
}

#[async_trait]
impl DeliveryService for DistributedDelivery {
    fn connect(&self, receiver_id: ReceiverId, last_event_id: Option<EventId>) -> EventStream {
        self.local.open_stream(receiver_id, last_event_id)
    }

    async fn send(
        &self,
        receiver_ids: &[ReceiverId],
        event_name: &str,
        payload: Value,
    ) -> DeliveryReport {
        let report = self.local.send_event(receiver_ids, event_name, payload, None);
        self.publish(FanoutMessage::targeted(&report.event, receiver_ids, &self.origin))
            .await;
        report
    }

    async fn broadcast(&self, event_name: &str, payload: Value) -> DeliveryReport {
        let report = self.local.broadcast_event(event_name, payload, None);
        self.publish(FanoutMessage::broadcast(&report.event, &self.origin))
            .await;
        report
    }

    fn heartbeat(&self) -> SweepReport {
        self.local.heartbeat()
    }

    fn cleanup(&self) -> SweepReport {
        self.local.cleanup()
    }

    fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.local.registry()
    }

    fn strategy(&self) -> DeliveryStrategy {
        DeliveryStrategy::Distributed
    }
}

impl std::fmt::Debug for DistributedDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedDelivery")
            .field("origin", &self.origin)
            .field("transport", &self.transport.name())
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::LocalOptions;
    use crate::fanout::{MemoryEventLog, MemoryFanout};
    use futures::StreamExt;
    use futures::stream::BoxStream;
    use herald_core::logging::capture_logs;
    use serde_json::json;

    struct Unreachable;

    #[async_trait]
    impl FanoutTransport for Unreachable {
        async fn publish(&self, address: FanoutAddress, _: String) -> Result<(), FanoutError> {
            Err(FanoutError::Publish {
                address,
                reason: "connection refused".into(),
            })
        }

        async fn subscribe(
            &self,
            address: FanoutAddress,
        ) -> Result<BoxStream<'static, String>, FanoutError> {
            Err(FanoutError::Subscribe {
                address,
                reason: "connection refused".into(),
            })
        }

        fn name(&self) -> &'static str {
            "unreachable"
        }
    }

    struct Stalled;

    #[async_trait]
    impl FanoutTransport for Stalled {
        async fn publish(&self, _: FanoutAddress, _: String) -> Result<(), FanoutError> {
            futures::future::pending().await
        }

        async fn subscribe(
            &self,
            _: FanoutAddress,
        ) -> Result<BoxStream<'static, String>, FanoutError> {
            Ok(futures::stream::pending().boxed())
        }

        fn name(&self) -> &'static str {
            "stalled"
        }
    }

    fn local() -> Arc<LocalDelivery> {
        Arc::new(LocalDelivery::new(LocalOptions {
            replay_capacity: 16,
            queue_capacity: 16,
            connection_timeout: None,
        }))
    }

    #[tokio::test]
    async fn publish_failure_does_not_block_local_delivery() {
        let (logs, _guard) = capture_logs();
        let svc = DistributedDelivery::new(local(), Arc::new(Unreachable), ProcessId::from("a"));
        let mut x = svc.connect(ReceiverId::from("x"), None);
        let _ = x.try_recv();

        let report = svc
            .send(&[ReceiverId::from("x")], "message.created", json!({}))
            .await;
        assert_eq!(report.delivered, 1);
        assert_eq!(x.try_recv().unwrap().name, "message.created");
        assert!(logs.has_event(tracing::Level::WARN, "fan-out publish failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_publish_is_bounded() {
        let svc = DistributedDelivery::new(local(), Arc::new(Stalled), ProcessId::from("a"))
            .with_publish_timeout(Duration::from_millis(100));
        let _x = svc.connect(ReceiverId::from("x"), None);
        let report = svc.broadcast("presence.changed", Value::Null).await;
        assert_eq!(report.attempted, 1);
    }

    #[tokio::test]
    async fn send_publishes_targeted_envelope() {
        let hub = MemoryFanout::new();
        let mut targeted = hub.subscribe(FanoutAddress::Targeted).await.unwrap();
        let svc = DistributedDelivery::new(local(), Arc::new(hub.clone()), ProcessId::from("a"));

        let targets = [ReceiverId::from("x"), ReceiverId::from("y")];
        let report = svc.send(&targets, "message.created", json!({"n": 1})).await;

        let raw = targeted.next().await.unwrap();
        let message = FanoutMessage::decode(&raw).unwrap();
        assert_eq!(message.origin_process_id.as_str(), "a");
        assert_eq!(message.event_id.as_ref(), Some(&report.event.id));
        assert_eq!(
            message.target_users.unwrap(),
            vec![ReceiverId::from("x"), ReceiverId::from("y")]
        );
    }

    #[tokio::test]
    async fn broadcast_publishes_on_broadcast_address() {
        let hub = MemoryFanout::new();
        let mut broadcast = hub.subscribe(FanoutAddress::Broadcast).await.unwrap();
        let svc = DistributedDelivery::new(local(), Arc::new(hub.clone()), ProcessId::from("a"));
        let _ = svc.broadcast("role.changed", Value::Null).await;
        let message = FanoutMessage::decode(&broadcast.next().await.unwrap()).unwrap();
        assert!(message.target_users.is_none());
        assert_eq!(message.event_name, "role.changed");
    }

    #[tokio::test]
    async fn log_kinds_go_through_the_log_only() {
        let hub = MemoryFanout::new();
        let mut targeted = hub.subscribe(FanoutAddress::Targeted).await.unwrap();
        let log = Arc::new(MemoryEventLog::new(10));
        let svc = DistributedDelivery::new(local(), Arc::new(hub.clone()), ProcessId::from("a"))
            .with_log(log.clone(), ["message.created"]);

        let _ = svc.send(&[ReceiverId::from("x")], "message.created", Value::Null).await;
        let _ = svc.send(&[ReceiverId::from("x")], "presence.changed", Value::Null).await;

        assert_eq!(log.len(), 1);
        let raw = targeted.next().await.unwrap();
        assert_eq!(FanoutMessage::decode(&raw).unwrap().event_name, "presence.changed");
        assert!(svc.log_bridge(Duration::ZERO).is_some());
    }

    #[tokio::test]
    async fn empty_log_kinds_disable_the_log() {
        let hub = Arc::new(MemoryFanout::new());
        let svc = DistributedDelivery::new(local(), hub, ProcessId::from("a"))
            .with_log(Arc::new(MemoryEventLog::new(10)), Vec::<String>::new());
        assert!(svc.log_bridge(Duration::ZERO).is_none());
        assert_eq!(svc.strategy(), DeliveryStrategy::Distributed);
    }
}
