//! Single-process delivery strategy.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use herald_core::events::{HEARTBEAT, PING};
use herald_core::{DeliveryError, Event, EventId, ReceiverId};
use herald_settings::{DeliverySettings, DeliveryStrategy};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::connection::{Connection, DeliveryOutcome, Termination};
use super::registry::ConnectionRegistry;
use super::replay::ReplayBuffer;
use super::stream::EventStream;
use super::{DeliveryReport, DeliveryService, SweepReport};
use crate::metrics::{
    CONNECTIONS_PRUNED_TOTAL, DELIVERIES_TOTAL, EVENTS_SENT_TOTAL, REPLAY_EVENTS_TOTAL,
};

/// Tunables for [`LocalDelivery`].
#[derive(Clone, Debug)]
pub struct LocalOptions {
    /// Replay window size.
    pub replay_capacity: usize,
    /// Outbound queue per connection, excluding the replay backlog.
    pub queue_capacity: usize,
    /// Stream lifetime; `None` never times out.
    pub connection_timeout: Option<Duration>,
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self::from(&DeliverySettings::default())
    }
}

impl From<&DeliverySettings> for LocalOptions {
    fn from(settings: &DeliverySettings) -> Self {
        Self {
            replay_capacity: settings.replay_capacity,
            queue_capacity: settings.outbound_queue_capacity.max(1),
            connection_timeout: Some(settings.connection_timeout()),
        }
    }
}

/// Delivers to connections held by this process only.
///
/// Event creation, the replay append and the per-connection enqueue run
/// under one short critical section, as does registration of a new
/// connection with its replay. Each connection therefore receives events in
/// creation order, and a `send` issued after `connect` returns always reaches
/// the new connection. Writes never wait on a client: they land in the
/// connection's bounded queue or fail.
pub struct LocalDelivery {
    registry: Arc<ConnectionRegistry>,
    replay: ReplayBuffer,
    options: LocalOptions,
    sequencer: Mutex<()>,
}

impl LocalDelivery {
    /// Create a strategy with its own registry.
    pub fn new(options: LocalOptions) -> Self {
        Self::with_registry(Arc::new(ConnectionRegistry::new()), options)
    }

    /// Create a strategy over an existing registry.
    pub fn with_registry(registry: Arc<ConnectionRegistry>, options: LocalOptions) -> Self {
        Self {
            registry,
            replay: ReplayBuffer::new(options.replay_capacity),
            options,
            sequencer: Mutex::new(()),
        }
    }

    /// The replay window.
    pub fn replay(&self) -> &ReplayBuffer {
        &self.replay
    }

    /// Register a connection and queue its `connected` event and replay.
    pub fn open_stream(
        &self,
        receiver_id: ReceiverId,
        last_event_id: Option<EventId>,
    ) -> EventStream {
        let guard = self.sequencer.lock();

        let backlog = match &last_event_id {
            Some(id) => self.replay.events_after(Some(id)),
            None => Vec::new(),
        };
        // room for `connected` plus the whole backlog on top of the live queue
        let (tx, rx) = mpsc::channel(self.options.queue_capacity + backlog.len() + 1);
        let connection = Arc::new(Connection::new(receiver_id, tx));
        self.registry.register(Arc::clone(&connection));
        connection.open();

        let connected = Arc::new(Event::connected(connection.id()));
        let acknowledged = connection.deliver(&connected).is_delivered();

        let mut replayed = 0usize;
        if acknowledged {
            for event in &backlog {
                match connection.deliver(event) {
                    DeliveryOutcome::Delivered => replayed += 1,
                    DeliveryOutcome::Failed(error) => {
                        debug!(
                            connection_id = %connection.id(),
                            error = %error,
                            replayed,
                            remaining = backlog.len() - replayed,
                            "replay stopped"
                        );
                        break;
                    }
                }
            }
        }
        drop(guard);

        if replayed > 0 {
            metrics::counter!(REPLAY_EVENTS_TOTAL).increment(replayed as u64);
        }
        debug!(
            receiver_id = %connection.receiver_id(),
            connection_id = %connection.id(),
            last_event_id = last_event_id.as_ref().map(EventId::as_str),
            replayed,
            "connection opened"
        );

        EventStream::new(
            connection,
            Arc::clone(&self.registry),
            rx,
            self.options.connection_timeout,
        )
    }

    /// Create an event and deliver it to the connections of `receiver_ids`.
    ///
    /// `id` reuses an id allocated by a peer process; `None` allocates one.
    /// The event is stamped under the sequencing lock, so every connection
    /// sees events in creation order. Duplicate receiver ids are attempted
    /// once. The event is appended to the replay window even when no
    /// connection is reached.
    pub fn send_event(
        &self,
        receiver_ids: &[ReceiverId],
        name: &str,
        payload: Value,
        id: Option<EventId>,
    ) -> DeliveryReport {
        let mut failed = Vec::new();
        let (event, mut report) = {
            let _guard = self.sequencer.lock();
            let event = stamp(name, payload, id);
            let mut report = DeliveryReport::new(Arc::clone(&event));
            self.replay.append(Arc::clone(&event));
            let mut seen = HashSet::with_capacity(receiver_ids.len());
            for receiver_id in receiver_ids {
                if !seen.insert(receiver_id) {
                    continue;
                }
                for connection in self.registry.list_for(receiver_id) {
                    attempt(&connection, &event, &mut report, &mut failed);
                }
            }
            (event, report)
        };
        report.pruned = self.prune(failed);
        metrics::counter!(EVENTS_SENT_TOTAL, "kind" => "targeted").increment(1);
        debug!(
            event_id = %event.id,
            event_name = %event.name,
            receivers = receiver_ids.len(),
            attempted = report.attempted,
            delivered = report.delivered,
            "event sent"
        );
        report
    }

    /// Create an event and deliver it to every connection.
    ///
    /// Stamped under the sequencing lock like [`LocalDelivery::send_event`].
    pub fn broadcast_event(
        &self,
        name: &str,
        payload: Value,
        id: Option<EventId>,
    ) -> DeliveryReport {
        let mut failed = Vec::new();
        let (event, mut report) = {
            let _guard = self.sequencer.lock();
            let event = stamp(name, payload, id);
            let mut report = DeliveryReport::new(Arc::clone(&event));
            self.replay.append(Arc::clone(&event));
            for connection in self.registry.all_connections() {
                attempt(&connection, &event, &mut report, &mut failed);
            }
            (event, report)
        };
        report.pruned = self.prune(failed);
        metrics::counter!(EVENTS_SENT_TOTAL, "kind" => "broadcast").increment(1);
        debug!(
            event_id = %event.id,
            event_name = %event.name,
            attempted = report.attempted,
            delivered = report.delivered,
            "event broadcast"
        );
        report
    }

    /// Write a liveness probe named `name` to every connection.
    ///
    /// Probes are not stored for replay.
    pub fn probe(&self, name: &'static str) -> SweepReport {
        let probe = Arc::new(Event::probe(name));
        let mut report = SweepReport::default();
        let mut failed = Vec::new();
        {
            let _guard = self.sequencer.lock();
            for connection in self.registry.all_connections() {
                report.probed += 1;
                if let DeliveryOutcome::Failed(error) = connection.deliver(&probe) {
                    failed.push((connection, error));
                }
            }
        }
        report.pruned = self.prune(failed);
        debug!(
            probe = name,
            probed = report.probed,
            pruned = report.pruned,
            "liveness sweep finished"
        );
        report
    }

    fn prune(&self, failed: Vec<(Arc<Connection>, DeliveryError)>) -> usize {
        let mut pruned = 0;
        for (connection, error) in failed {
            if self.registry.deregister(&connection, Termination::Errored) {
                pruned += 1;
                metrics::counter!(CONNECTIONS_PRUNED_TOTAL, "error" => error.label()).increment(1);
                warn!(
                    receiver_id = %connection.receiver_id(),
                    connection_id = %connection.id(),
                    error = %error,
                    "pruned dead connection"
                );
            }
        }
        pruned
    }
}

fn stamp(name: &str, payload: Value, id: Option<EventId>) -> Arc<Event> {
    Arc::new(match id {
        Some(id) => Event::with_id(id, name, payload),
        None => Event::new(name, payload),
    })
}

fn attempt(
    connection: &Arc<Connection>,
    event: &Arc<Event>,
    report: &mut DeliveryReport,
    failed: &mut Vec<(Arc<Connection>, DeliveryError)>,
) {
    report.attempted += 1;
    match connection.deliver(event) {
        DeliveryOutcome::Delivered => {
            report.delivered += 1;
            metrics::counter!(DELIVERIES_TOTAL).increment(1);
        }
        DeliveryOutcome::Failed(error) => failed.push((Arc::clone(connection), error)),
    }
}

#[async_trait]
impl DeliveryService for LocalDelivery {
    fn connect(&self, receiver_id: ReceiverId, last_event_id: Option<EventId>) -> EventStream {
        self.open_stream(receiver_id, last_event_id)
    }

    async fn send(
        &self,
        receiver_ids: &[ReceiverId],
        event_name: &str,
        payload: Value,
    ) -> DeliveryReport {
        self.send_event(receiver_ids, event_name, payload, None)
    }

    async fn broadcast(&self, event_name: &str, payload: Value) -> DeliveryReport {
        self.broadcast_event(event_name, payload, None)
    }

    fn heartbeat(&self) -> SweepReport {
        self.probe(HEARTBEAT)
    }

    fn cleanup(&self) -> SweepReport {
        self.probe(PING)
    }

    fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn strategy(&self) -> DeliveryStrategy {
        DeliveryStrategy::Local
    }
}

impl std::fmt::Debug for LocalDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDelivery")
            .field("connections", &self.registry.connection_count())
            .field("replay", &self.replay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::connection::ConnectionState;
    use herald_core::events::CONNECTED;
    use herald_core::logging::capture_logs;
    use serde_json::json;

    fn service() -> LocalDelivery {
        LocalDelivery::new(LocalOptions {
            replay_capacity: 10,
            queue_capacity: 8,
            connection_timeout: None,
        })
    }

    fn receivers(ids: &[&str]) -> Vec<ReceiverId> {
        ids.iter().map(|id| ReceiverId::from(*id)).collect()
    }

    /// Connection whose client side is already gone: every write fails.
    fn dead_connection(svc: &LocalDelivery, receiver: &str) -> Arc<Connection> {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let connection = Arc::new(Connection::new(ReceiverId::from(receiver), tx));
        connection.open();
        svc.registry().register(connection.clone());
        connection
    }

    fn drain(stream: &mut EventStream) -> Vec<Arc<Event>> {
        std::iter::from_fn(|| stream.try_recv()).collect()
    }

    #[tokio::test]
    async fn connect_sends_connected_first() {
        let svc = service();
        let mut stream = svc.connect(ReceiverId::from("alice"), None);
        let first = stream.try_recv().unwrap();
        assert_eq!(first.name, CONNECTED);
        assert_eq!(first.payload["connectionId"], stream.connection_id().as_str());
        assert_eq!(svc.registry().connection_count(), 1);
    }

    #[tokio::test]
    async fn connect_then_send_reaches_new_connection() {
        let svc = service();
        let mut stream = svc.connect(ReceiverId::from("alice"), None);
        let report = svc
            .send(&receivers(&["alice"]), "message.created", json!({"text": "hi"}))
            .await;
        assert_eq!(report.attempted, 1);
        assert_eq!(report.delivered, 1);
        let names: Vec<_> = drain(&mut stream).iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, ["connected", "message.created"]);
    }

    #[tokio::test]
    async fn one_attempt_per_connection() {
        let svc = service();
        let _a1 = svc.connect(ReceiverId::from("alice"), None);
        let _a2 = svc.connect(ReceiverId::from("alice"), None);
        let _b1 = svc.connect(ReceiverId::from("bob"), None);
        let report = svc
            .send(&receivers(&["alice", "alice", "carol"]), "x", Value::Null)
            .await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 2);
    }

    #[tokio::test]
    async fn failed_write_prunes_only_that_connection() {
        let svc = service();
        let mut alive = svc.connect(ReceiverId::from("x"), None);
        let dead = dead_connection(&svc, "x");

        let report = svc.send(&receivers(&["x"]), "presence.changed", Value::Null).await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.pruned, 1);

        let left = svc.registry().list_for("x");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id(), alive.connection_id());
        assert_eq!(dead.state(), ConnectionState::Removed);

        // the next broadcast does not touch the pruned connection again
        let report = svc.broadcast("y", Value::Null).await;
        assert_eq!(report.attempted, 1);
        assert_eq!(dead.failed_count(), 1);
        assert_eq!(drain(&mut alive).len(), 3);
    }

    #[tokio::test]
    async fn prune_is_logged_at_warn() {
        let (logs, _guard) = capture_logs();
        let svc = service();
        let _dead = dead_connection(&svc, "x");
        let _ = svc.send(&receivers(&["x"]), "x", Value::Null).await;
        assert!(logs.has_event(tracing::Level::WARN, "pruned dead connection"));
        assert_eq!(logs.field("pruned dead connection", "receiver_id").as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn broadcast_attempts_every_connection() {
        let svc = service();
        let _streams: Vec<_> = ["a", "a", "b", "c", "c", "c"]
            .iter()
            .map(|r| svc.connect(ReceiverId::from(*r), None))
            .collect();
        let report = svc.broadcast("role.changed", Value::Null).await;
        assert_eq!(report.attempted, 6);
        assert_eq!(report.delivered, 6);
    }

    #[tokio::test]
    async fn reconnect_replays_after_last_seen() {
        let svc = service();
        let first = svc.send(&receivers(&["alice"]), "m1", Value::Null).await;
        let _ = svc.send(&receivers(&["bob"]), "m2", Value::Null).await;
        let _ = svc.send(&receivers(&["alice"]), "m3", Value::Null).await;

        let mut stream = svc.connect(ReceiverId::from("alice"), Some(first.event.id.clone()));
        let names: Vec<_> = drain(&mut stream).iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, ["connected", "m2", "m3"]);
    }

    #[tokio::test]
    async fn reconnect_with_evicted_id_replays_nothing() {
        let svc = LocalDelivery::new(LocalOptions {
            replay_capacity: 2,
            queue_capacity: 8,
            connection_timeout: None,
        });
        let first = svc.broadcast("m1", Value::Null).await;
        let _ = svc.broadcast("m2", Value::Null).await;
        let _ = svc.broadcast("m3", Value::Null).await;
        let mut stream = svc.connect(ReceiverId::from("alice"), Some(first.event.id.clone()));
        assert_eq!(drain(&mut stream).len(), 1);
    }

    #[tokio::test]
    async fn connect_without_last_seen_skips_replay() {
        let svc = service();
        let _ = svc.broadcast("m1", Value::Null).await;
        let mut stream = svc.connect(ReceiverId::from("alice"), None);
        assert_eq!(drain(&mut stream).len(), 1);
    }

    #[tokio::test]
    async fn replay_larger_than_queue_still_fits() {
        let svc = LocalDelivery::new(LocalOptions {
            replay_capacity: 50,
            queue_capacity: 2,
            connection_timeout: None,
        });
        let first = svc.broadcast("m0", Value::Null).await;
        for i in 1..30 {
            let _ = svc.broadcast(&format!("m{i}"), Value::Null).await;
        }
        let mut stream = svc.connect(ReceiverId::from("alice"), Some(first.event.id.clone()));
        assert_eq!(drain(&mut stream).len(), 30);
    }

    #[tokio::test]
    async fn heartbeat_probes_and_prunes_without_touching_replay() {
        let svc = service();
        let mut stream = svc.connect(ReceiverId::from("alice"), None);
        let _dead = dead_connection(&svc, "bob");

        let report = svc.heartbeat();
        assert_eq!(report, SweepReport { probed: 2, pruned: 1 });
        assert_eq!(svc.registry().connection_count(), 1);
        assert!(svc.replay().is_empty());

        let report = svc.cleanup();
        assert_eq!(report, SweepReport { probed: 1, pruned: 0 });
        let names: Vec<_> = drain(&mut stream).iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, ["connected", "heartbeat", "ping"]);
    }

    #[test]
    fn events_keep_creation_order_under_concurrent_producers() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 500;
        let svc = LocalDelivery::new(LocalOptions {
            replay_capacity: 16,
            queue_capacity: THREADS * PER_THREAD,
            connection_timeout: None,
        });
        let mut stream = svc.connect(ReceiverId::from("alice"), None);
        let _ = stream.try_recv();

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                let _ = scope.spawn(|| {
                    for _ in 0..PER_THREAD {
                        let _ = futures::executor::block_on(svc.send(
                            &[ReceiverId::from("alice")],
                            "tick",
                            Value::Null,
                        ));
                    }
                });
            }
        });

        let received = drain(&mut stream);
        assert_eq!(received.len(), THREADS * PER_THREAD);
        let inversions = received
            .windows(2)
            .filter(|w| w[0].created_at > w[1].created_at || w[0].id > w[1].id)
            .count();
        assert_eq!(inversions, 0);
    }

    #[tokio::test]
    async fn dropped_stream_no_longer_receives() {
        let svc = service();
        let stream = svc.connect(ReceiverId::from("alice"), None);
        drop(stream);
        let report = svc.send(&receivers(&["alice"]), "x", Value::Null).await;
        assert_eq!(report.attempted, 0);
        assert_eq!(svc.registry().receiver_count(), 0);
    }

    #[tokio::test]
    async fn strategy_is_local() {
        assert_eq!(service().strategy(), DeliveryStrategy::Local);
    }
}
