use crate::redis_cache::{connection, unavailable};
use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::Pool;
use duplex::ports::{BusMessage, BusStream, EventBus};
use futures::StreamExt;
use redis::AsyncCommands;
use shared::{Error, Result};

/// Event bus on Redis pub/sub.
///
/// Publishes go through the pool. Each subscription holds its own dedicated
/// pub/sub connection and pattern-subscribes, so native keyevent
/// notifications arrive the same way as cache events.
pub struct RedisEventBus {
    pool: Pool,
    client: redis::Client,
}

impl RedisEventBus {
    pub fn new(pool: Pool, url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("redis url '{}': {}", url, e)))?;
        Ok(Self { pool, client })
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        let mut conn = connection(&self.pool).await?;
        let receivers: u64 = conn
            .publish(topic, payload.as_ref())
            .await
            .map_err(unavailable)?;
        tracing::trace!(topic = %topic, receivers, "Redis PUBLISH");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(unavailable)?;
        pubsub.psubscribe(pattern).await.map_err(unavailable)?;
        tracing::debug!(pattern = %pattern, "Redis PSUBSCRIBE");

        // The stream ends when the pub/sub connection drops
        let stream = pubsub.into_on_message().map(|msg| BusMessage {
            topic: msg.get_channel_name().to_string(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        });
        Ok(stream.boxed())
    }
}

impl std::fmt::Debug for RedisEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEventBus")
            .field("pool", &self.pool.status())
            .finish()
    }
}
