//! Redis Streams implementation of [`EventLog`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use tracing::info;

use super::FanoutError;
use super::log::{EventLog, LOG_START, LogEntry};

/// Stream field holding the encoded envelope.
const ENVELOPE_FIELD: &str = "envelope";

/// Envelope log on a Redis stream (`XADD` with approximate `MAXLEN`,
/// blocking `XREAD`).
///
/// Blocking reads use their own connection so they never stall appends.
pub struct RedisStreamLog {
    writer: MultiplexedConnection,
    reader: MultiplexedConnection,
    key: String,
    max_len: usize,
}

impl RedisStreamLog {
    /// Connect to `url` and use the stream at `key`.
    pub async fn connect(
        url: &str,
        key: impl Into<String>,
        max_len: usize,
    ) -> Result<Self, FanoutError> {
        let client = Client::open(url)?;
        let writer = client.get_multiplexed_async_connection().await?;
        let reader = client.get_multiplexed_async_connection().await?;
        let key = key.into();
        info!(stream = %key, max_len, "connected to redis event log");
        Ok(Self {
            writer,
            reader,
            key,
            max_len: max_len.max(1),
        })
    }
}

#[async_trait]
impl EventLog for RedisStreamLog {
    async fn append(&self, payload: String) -> Result<String, FanoutError> {
        let mut conn = self.writer.clone();
        let id: String = conn
            .xadd_maxlen(
                &self.key,
                StreamMaxlen::Approx(self.max_len),
                "*",
                &[(ENVELOPE_FIELD, payload)],
            )
            .await?;
        Ok(id)
    }

    async fn read_after(
        &self,
        cursor: &str,
        block: Duration,
        limit: usize,
    ) -> Result<Vec<LogEntry>, FanoutError> {
        let mut options = StreamReadOptions::default().count(limit.max(1));
        // BLOCK 0 would wait forever
        if !block.is_zero() {
            let millis = usize::try_from(block.as_millis()).unwrap_or(usize::MAX);
            options = options.block(millis);
        }

        let mut conn = self.reader.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[self.key.as_str()], &[cursor], &options)
            .await?;

        let mut entries = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for id in stream.ids {
                // a missing field still advances the cursor; the bridge drops it
                let payload = id.get::<String>(ENVELOPE_FIELD).unwrap_or_default();
                entries.push(LogEntry {
                    cursor: id.id,
                    payload,
                });
            }
        }
        Ok(entries)
    }

    async fn head(&self) -> Result<String, FanoutError> {
        let mut conn = self.writer.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(&self.key, "+", "-", 1).await?;
        Ok(reply
            .ids
            .into_iter()
            .next()
            .map_or_else(|| LOG_START.to_string(), |id| id.id))
    }

    fn name(&self) -> &'static str {
        "redis-stream"
    }
}
