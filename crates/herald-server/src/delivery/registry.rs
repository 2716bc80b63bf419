//! Per-process table of open connections keyed by receiver id.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use herald_core::{ConnectionId, ReceiverId};
use tracing::debug;

use super::connection::{Connection, Termination};
use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED_TOTAL, CONNECTIONS_OPENED_TOTAL};

/// Open connections of this process, grouped by receiver.
///
/// Backed by a sharded map so unrelated receivers never contend on one lock.
/// A receiver with no connections has no entry.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ReceiverId, Vec<Arc<Connection>>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` under its receiver.
    pub fn register(&self, connection: Arc<Connection>) {
        let receiver_id = connection.receiver_id().clone();
        self.connections
            .entry(receiver_id)
            .or_default()
            .push(connection);
        metrics::counter!(CONNECTIONS_OPENED_TOTAL).increment(1);
        metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
    }

    /// Connections currently open for `receiver_id`.
    pub fn list_for(&self, receiver_id: &str) -> Vec<Arc<Connection>> {
        self.connections
            .get(receiver_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Remove one connection. Returns `false` if it was not registered.
    ///
    /// Dropping the last connection of a receiver drops the receiver entry.
    pub fn remove(&self, receiver_id: &str, connection_id: &ConnectionId) -> bool {
        let removed = match self.connections.get_mut(receiver_id) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|c| c.id() != connection_id);
                entry.len() < before
            }
            None => false,
        };
        // Re-checked under the shard lock so a concurrent register is never lost.
        let _ = self
            .connections
            .remove_if(receiver_id, |_, conns| conns.is_empty());
        if removed {
            metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        }
        removed
    }

    /// Terminate, deregister and seal `connection`.
    ///
    /// Safe to call repeatedly; only the first call records `termination`.
    pub fn deregister(&self, connection: &Connection, termination: Termination) -> bool {
        let first_signal = connection.terminate(termination);
        let removed = self.remove(connection.receiver_id(), connection.id());
        connection.mark_removed();
        if removed {
            metrics::counter!(CONNECTIONS_CLOSED_TOTAL, "reason" => termination.label())
                .increment(1);
            debug!(
                receiver_id = %connection.receiver_id(),
                connection_id = %connection.id(),
                reason = termination.label(),
                "connection deregistered"
            );
        }
        first_signal && removed
    }

    /// Snapshot of every receiver and its connections.
    pub fn list_all(&self) -> HashMap<ReceiverId, Vec<Arc<Connection>>> {
        self.connections
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Flat snapshot of every open connection.
    pub fn all_connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect()
    }

    /// Total open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.iter().map(|entry| entry.value().len()).sum()
    }

    /// Receivers with at least one open connection.
    pub fn receiver_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::connection::ConnectionState;
    use herald_core::Event;
    use tokio::sync::mpsc;

    fn make_connection(receiver: &str) -> (Arc<Connection>, mpsc::Receiver<Arc<Event>>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(Connection::new(ReceiverId::from(receiver), tx)), rx)
    }

    #[test]
    fn register_and_list() {
        let registry = ConnectionRegistry::new();
        let (a1, _r1) = make_connection("alice");
        let (a2, _r2) = make_connection("alice");
        let (b1, _r3) = make_connection("bob");
        registry.register(a1);
        registry.register(a2);
        registry.register(b1);

        assert_eq!(registry.list_for("alice").len(), 2);
        assert_eq!(registry.list_for("bob").len(), 1);
        assert!(registry.list_for("carol").is_empty());
        assert_eq!(registry.connection_count(), 3);
        assert_eq!(registry.receiver_count(), 2);
    }

    #[test]
    fn removing_last_connection_drops_receiver() {
        let registry = ConnectionRegistry::new();
        let (a1, _r1) = make_connection("alice");
        registry.register(a1.clone());
        assert!(registry.remove("alice", a1.id()));
        assert_eq!(registry.receiver_count(), 0);
        assert!(registry.list_all().is_empty());
    }

    #[test]
    fn removing_one_keeps_the_others() {
        let registry = ConnectionRegistry::new();
        let (a1, _r1) = make_connection("alice");
        let (a2, _r2) = make_connection("alice");
        registry.register(a1.clone());
        registry.register(a2.clone());
        assert!(registry.remove("alice", a1.id()));
        let left = registry.list_for("alice");
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id(), a2.id());
    }

    #[test]
    fn removing_unregistered_is_noop() {
        let registry = ConnectionRegistry::new();
        let (a1, _r1) = make_connection("alice");
        assert!(!registry.remove("alice", a1.id()));
        registry.register(a1);
        assert!(!registry.remove("alice", &ConnectionId::from("nope")));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn deregister_seals_connection() {
        let registry = ConnectionRegistry::new();
        let (a1, _r1) = make_connection("alice");
        a1.open();
        registry.register(a1.clone());
        assert!(registry.deregister(&a1, Termination::Completed));
        assert_eq!(a1.state(), ConnectionState::Removed);
        assert_eq!(registry.connection_count(), 0);
        // second signal is a no-op
        assert!(!registry.deregister(&a1, Termination::Errored));
    }

    #[test]
    fn list_all_groups_by_receiver() {
        let registry = ConnectionRegistry::new();
        let (a1, _r1) = make_connection("alice");
        let (b1, _r2) = make_connection("bob");
        let (b2, _r3) = make_connection("bob");
        registry.register(a1);
        registry.register(b1);
        registry.register(b2);
        let all = registry.list_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all["bob"].len(), 2);
        assert_eq!(registry.all_connections().len(), 3);
    }

    #[test]
    fn concurrent_register_and_remove() {
        let registry = Arc::new(ConnectionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut keep = Vec::new();
                    for i in 0..200 {
                        let receiver = format!("user_{}", i % 10);
                        let (conn, rx) = make_connection(&receiver);
                        registry.register(conn.clone());
                        if (i + t) % 2 == 0 {
                            assert!(registry.remove(&receiver, conn.id()));
                        } else {
                            keep.push((conn, rx));
                        }
                    }
                    keep.len()
                })
            })
            .collect();
        let kept: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(registry.connection_count(), kept);
        for (_, conns) in registry.list_all() {
            assert!(!conns.is_empty());
        }
    }
}
