//! Bounded recent-event window for reconnect catch-up.

use std::collections::VecDeque;
use std::sync::Arc;

use herald_core::{Event, EventId};
use parking_lot::RwLock;

/// Bounded, insertion-ordered cache of recent events.
///
/// Oldest entries are evicted first once `capacity` is exceeded. Readers
/// clone `Arc`s out under a read lock, so a concurrent reader sees the window
/// either before or after a given append, never a partial entry.
pub struct ReplayBuffer {
    capacity: usize,
    events: RwLock<VecDeque<Arc<Event>>>,
}

impl ReplayBuffer {
    /// Create an empty window. A zero capacity is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Maximum number of events held.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events currently held.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Append `event`, evicting the oldest entries beyond capacity.
    pub fn append(&self, event: Arc<Event>) {
        let mut events = self.events.write();
        events.push_back(event);
        while events.len() > self.capacity {
            let _ = events.pop_front();
        }
    }

    /// Events newer than `last_seen`, oldest first.
    ///
    /// `None` returns the whole window. An id that is no longer (or never
    /// was) in the window returns nothing, not the whole window.
    pub fn events_after(&self, last_seen: Option<&EventId>) -> Vec<Arc<Event>> {
        let events = self.events.read();
        match last_seen {
            None => events.iter().cloned().collect(),
            Some(id) => match events.iter().rposition(|e| &e.id == id) {
                Some(pos) => events.iter().skip(pos + 1).cloned().collect(),
                None => Vec::new(),
            },
        }
    }
}

impl std::fmt::Debug for ReplayBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}
