use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use duplex::ports::{SharedCache, escape_glob};
use redis::AsyncCommands;
use serde::Serialize;
use serde::de::DeserializeOwned;
use shared::{Error, Result, TtlMs};
use std::fmt::Display;
use std::marker::PhantomData;

const SCAN_BATCH: usize = 500;

pub(crate) fn unavailable(e: impl Display) -> Error {
    Error::TierUnavailable(format!("redis: {}", e))
}

pub(crate) async fn connection(pool: &Pool) -> Result<Connection> {
    pool.get()
        .await
        .map_err(|e| Error::TierUnavailable(format!("redis pool: {}", e)))
}

/// Shared tier on Redis. Values are stored as JSON.
pub struct RedisSharedCache<V> {
    pool: Pool,
    _marker: PhantomData<fn() -> V>,
}

impl<V> RedisSharedCache<V> {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            _marker: PhantomData,
        }
    }
}

impl<V> Clone for RedisSharedCache<V> {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}

#[async_trait]
impl<V> SharedCache<V> for RedisSharedCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>> {
        let mut conn = connection(&self.pool).await?;
        let raw: Option<Vec<u8>> = conn.get(key).await.map_err(unavailable)?;
        raw.map(|bytes| decode_value(key, &bytes)).transpose()
    }

    async fn put(&self, key: &str, value: V, ttl: Option<TtlMs>) -> Result<()> {
        let payload = encode_value(key, &value)?;
        let mut conn = connection(&self.pool).await?;
        let written: redis::RedisResult<()> = match ttl {
            // Redis rejects a zero expiry
            Some(ttl) => conn.pset_ex(key, payload, ttl.0.max(1)).await,
            None => conn.set(key, payload).await,
        };
        written.map_err(unavailable)?;
        tracing::trace!(key = %key, ttl_ms = ?ttl.map(|t| t.0), "Redis SET");
        Ok(())
    }

    async fn evict(&self, key: &str) -> Result<bool> {
        let mut conn = connection(&self.pool).await?;
        let removed: u64 = conn.del(key).await.map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn clear(&self, prefix: &str) -> Result<u64> {
        let mut conn = connection(&self.pool).await?;
        let pattern = format!("{}*", escape_glob(prefix));

        let mut cursor: u64 = 0;
        let mut removed = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;

            if !keys.is_empty() {
                let deleted: u64 = conn.del(&keys).await.map_err(unavailable)?;
                removed += deleted;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        tracing::debug!(pattern = %pattern, removed, "Redis clear");
        Ok(removed)
    }

    async fn ttl(&self, key: &str) -> Result<Option<TtlMs>> {
        let mut conn = connection(&self.pool).await?;
        let remaining: i64 = conn.pttl(key).await.map_err(unavailable)?;
        Ok(ttl_from_pttl(remaining))
    }

    async fn expire(&self, key: &str, ttl: TtlMs) -> Result<bool> {
        let mut conn = connection(&self.pool).await?;
        let millis = i64::try_from(ttl.0.max(1)).unwrap_or(i64::MAX);
        conn.pexpire(key, millis).await.map_err(unavailable)
    }
}

impl<V> std::fmt::Debug for RedisSharedCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSharedCache")
            .field("pool", &self.pool.status())
            .finish()
    }
}

/// Turn on `__keyevent@<db>__:expired` notifications on the server.
///
/// Managed Redis offerings often forbid `CONFIG SET`; there the flag has to
/// be set out of band and this call fails.
pub async fn enable_expiry_notifications(pool: &Pool) -> Result<()> {
    let mut conn = connection(pool).await?;
    let _: () = redis::cmd("CONFIG")
        .arg("SET")
        .arg("notify-keyspace-events")
        .arg("Ex")
        .query_async(&mut conn)
        .await
        .map_err(unavailable)?;
    tracing::info!("Enabled Redis key expiry notifications");
    Ok(())
}

fn encode_value<V: Serialize>(key: &str, value: &V) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Encode(format!("value for '{}': {}", key, e)))
}

fn decode_value<V: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<V> {
    serde_json::from_slice(bytes).map_err(|e| Error::Decode(format!("value at '{}': {}", key, e)))
}

// PTTL answers -2 for a missing key and -1 for a key without expiry
fn ttl_from_pttl(reply: i64) -> Option<TtlMs> {
    u64::try_from(reply).ok().map(TtlMs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use duplex::CachedValue;
    use std::time::Duration;

    fn unreachable_pool() -> Pool {
        let mut config = deadpool_redis::Config::from_url("redis://127.0.0.1:1");
        if let Some(ref mut pool) = config.pool {
            pool.timeouts.wait = Some(Duration::from_millis(200));
            pool.timeouts.create = Some(Duration::from_millis(200));
        }
        config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap()
    }

    #[test]
    fn test_ttl_from_pttl() {
        assert_eq!(ttl_from_pttl(-2), None);
        assert_eq!(ttl_from_pttl(-1), None);
        assert_eq!(ttl_from_pttl(1500), Some(TtlMs(1500)));
    }

    #[test]
    fn test_value_codec() {
        let stored = encode_value("k", &CachedValue::Present(vec![1, 2, 3])).unwrap();
        let back: CachedValue<Vec<i32>> = decode_value("k", &stored).unwrap();
        assert_eq!(back, CachedValue::Present(vec![1, 2, 3]));

        let null = encode_value("k", &CachedValue::<String>::Null).unwrap();
        let back: CachedValue<String> = decode_value("k", &null).unwrap();
        assert!(back.is_null());

        let err = decode_value::<CachedValue<String>>("k", b"not json").unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let cache: RedisSharedCache<CachedValue<String>> = RedisSharedCache::new(unreachable_pool());

        let err = cache.get("users::k").await.unwrap_err();
        assert!(matches!(err, Error::TierUnavailable(_)));

        let err = cache
            .put("users::k", CachedValue::Null, Some(TtlMs(1000)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TierUnavailable(_)));
    }
}
