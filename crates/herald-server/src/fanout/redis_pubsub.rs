//! Redis PUBLISH / SUBSCRIBE transport.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::{debug, info, warn};

use super::{FanoutAddress, FanoutError, FanoutTransport};

/// Fan-out over Redis pub/sub channels `<prefix>:broadcast` and
/// `<prefix>:targeted`.
///
/// Publishes share one multiplexed connection; each subscription opens its
/// own pub/sub connection.
pub struct RedisFanout {
    client: Client,
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisFanout {
    /// Connect to `url`.
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, FanoutError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let prefix = prefix.into();
        info!(prefix = %prefix, "connected to redis fan-out");
        Ok(Self {
            client,
            conn,
            prefix,
        })
    }

    /// Concrete channel for `address`.
    pub fn channel(&self, address: FanoutAddress) -> String {
        address.channel(&self.prefix)
    }
}

#[async_trait]
impl FanoutTransport for RedisFanout {
    async fn publish(&self, address: FanoutAddress, payload: String) -> Result<(), FanoutError> {
        let channel = self.channel(address);
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(&channel, payload).await.map_err(|e| {
            FanoutError::Publish {
                address,
                reason: e.to_string(),
            }
        })?;
        debug!(%channel, receivers, "envelope published");
        Ok(())
    }

    async fn subscribe(
        &self,
        address: FanoutAddress,
    ) -> Result<BoxStream<'static, String>, FanoutError> {
        let channel = self.channel(address);
        let subscribe_err = |e: redis::RedisError| FanoutError::Subscribe {
            address,
            reason: e.to_string(),
        };
        let mut pubsub = self.client.get_async_pubsub().await.map_err(subscribe_err)?;
        pubsub.subscribe(&channel).await.map_err(subscribe_err)?;
        info!(%channel, "subscribed to redis channel");

        let stream = pubsub.into_on_message().filter_map(move |msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(error) => {
                    warn!(%address, %error, "non-text fan-out payload dropped");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let result = RedisFanout::connect("not-a-url", "herald").await;
        assert!(matches!(result, Err(FanoutError::Redis(_))));
    }
}
