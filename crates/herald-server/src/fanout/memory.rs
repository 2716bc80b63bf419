//! In-process fan-out hub.
//!
//! One hub is shared (cloned) by every simulated process in a single binary,
//! which makes it the transport for single-node deployments and tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, warn};

use super::{FanoutAddress, FanoutError, FanoutTransport};

/// Default per-address buffer.
const CHANNEL_CAPACITY: usize = 1024;

/// Tokio broadcast channel per fan-out address.
#[derive(Clone)]
pub struct MemoryFanout {
    inner: Arc<Channels>,
}

struct Channels {
    broadcast: broadcast::Sender<String>,
    targeted: broadcast::Sender<String>,
}

impl MemoryFanout {
    /// Create a hub with the default buffer.
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    /// Create a hub buffering `capacity` envelopes per address.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (broadcast, _) = broadcast::channel(capacity);
        let (targeted, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Channels { broadcast, targeted }),
        }
    }

    fn sender(&self, address: FanoutAddress) -> &broadcast::Sender<String> {
        match address {
            FanoutAddress::Broadcast => &self.inner.broadcast,
            FanoutAddress::Targeted => &self.inner.targeted,
        }
    }

    /// Current subscribers on `address`.
    pub fn subscriber_count(&self, address: FanoutAddress) -> usize {
        self.sender(address).receiver_count()
    }
}

impl Default for MemoryFanout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FanoutTransport for MemoryFanout {
    async fn publish(&self, address: FanoutAddress, payload: String) -> Result<(), FanoutError> {
        // no subscribers is not a failure, as with any pub/sub broker
        match self.sender(address).send(payload) {
            Ok(receivers) => debug!(%address, receivers, "envelope published"),
            Err(_) => debug!(%address, "envelope published with no subscribers"),
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        address: FanoutAddress,
    ) -> Result<BoxStream<'static, String>, FanoutError> {
        let rx = self.sender(address).subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |item| async move {
            match item {
                Ok(payload) => Some(payload),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(%address, skipped, "fan-out subscriber lagged, envelopes skipped");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_envelopes() {
        let hub = MemoryFanout::new();
        let mut a = hub.subscribe(FanoutAddress::Targeted).await.unwrap();
        let mut b = hub.clone().subscribe(FanoutAddress::Targeted).await.unwrap();
        hub.publish(FanoutAddress::Targeted, "hello".into()).await.unwrap();
        assert_eq!(a.next().await.as_deref(), Some("hello"));
        assert_eq!(b.next().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn addresses_are_isolated() {
        let hub = MemoryFanout::new();
        let mut broadcast = hub.subscribe(FanoutAddress::Broadcast).await.unwrap();
        hub.publish(FanoutAddress::Targeted, "t".into()).await.unwrap();
        hub.publish(FanoutAddress::Broadcast, "b".into()).await.unwrap();
        assert_eq!(broadcast.next().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let hub = MemoryFanout::new();
        assert_eq!(hub.subscriber_count(FanoutAddress::Broadcast), 0);
        assert!(hub.publish(FanoutAddress::Broadcast, "x".into()).await.is_ok());
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_and_continues() {
        let hub = MemoryFanout::with_capacity(2);
        let mut sub = hub.subscribe(FanoutAddress::Broadcast).await.unwrap();
        for i in 0..5 {
            hub.publish(FanoutAddress::Broadcast, i.to_string()).await.unwrap();
        }
        assert_eq!(sub.next().await.as_deref(), Some("3"));
        assert_eq!(sub.next().await.as_deref(), Some("4"));
    }
}
