//! Client-side handle returned by `connect`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use herald_core::{ConnectionId, Event, ReceiverId};
use tokio::sync::mpsc;
use tokio::time::Sleep;

use super::connection::{Connection, Termination};
use super::registry::ConnectionRegistry;

/// Events queued for one connection, in delivery order.
///
/// The host transport drains this and reports terminal signals through it:
/// the stream times out once its lifetime elapses, ends when the connection
/// is pruned, and deregisters as `Completed` when dropped.
pub struct EventStream {
    connection: Arc<Connection>,
    registry: Arc<ConnectionRegistry>,
    rx: mpsc::Receiver<Arc<Event>>,
    deadline: Option<Pin<Box<Sleep>>>,
    finished: bool,
}

impl EventStream {
    pub(crate) fn new(
        connection: Arc<Connection>,
        registry: Arc<ConnectionRegistry>,
        rx: mpsc::Receiver<Arc<Event>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            connection,
            registry,
            rx,
            deadline: timeout.map(|t| Box::pin(tokio::time::sleep(t))),
            finished: false,
        }
    }

    /// Id of the underlying connection.
    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    /// Receiver the stream belongs to.
    pub fn receiver_id(&self) -> &ReceiverId {
        self.connection.receiver_id()
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        if self.finished {
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Wait for the next event; `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        futures::StreamExt::next(self).await
    }

    /// Report a terminal signal from the host transport.
    pub fn terminate(&mut self, termination: Termination) {
        self.finish(termination);
    }

    fn finish(&mut self, termination: Termination) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.deadline = None;
        let _ = self.registry.deregister(&self.connection, termination);
        self.rx.close();
    }
}

impl Stream for EventStream {
    type Item = Arc<Event>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        let timed_out = self
            .deadline
            .as_mut()
            .is_some_and(|deadline| deadline.as_mut().poll(cx).is_ready());
        if timed_out {
            self.finish(Termination::TimedOut);
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(event)),
            Poll::Ready(None) => {
                // sender dropped: the connection was pruned or swept
                self.finished = true;
                self.deadline = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.finish(Termination::Completed);
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("connection", &self.connection)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
