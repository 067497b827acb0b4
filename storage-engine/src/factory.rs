use crate::memory_bus::MemoryEventBus;
use crate::memory_shared::MemorySharedCache;
use crate::moka_cache::MokaLocalCache;
use crate::redis_bus::RedisEventBus;
use crate::redis_cache::{RedisSharedCache, connection, enable_expiry_notifications};
use deadpool_redis::{Pool, Runtime};
use duplex::ports::{EventBus, LocalCache, SharedCache, TierFactory};
use duplex::{CacheKey, CacheValue, CachedValue};
use shared::config::{CacheConfig, RedisConfig};
use shared::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Tiers for nodes that share one process: moka locally, one in-memory
/// shared tier and one in-process bus for all caches.
pub struct MemoryTierFactory<V> {
    shared: Arc<MemorySharedCache<CachedValue<V>>>,
    bus: Arc<MemoryEventBus>,
}

impl<V> MemoryTierFactory<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let bus = Arc::new(MemoryEventBus::default());
        Self {
            shared: Arc::new(MemorySharedCache::with_notifier(bus.clone())),
            bus,
        }
    }

    /// The shared tier, for purging expired entries
    pub fn shared_cache(&self) -> Arc<MemorySharedCache<CachedValue<V>>> {
        Arc::clone(&self.shared)
    }

    pub fn event_bus(&self) -> Arc<MemoryEventBus> {
        Arc::clone(&self.bus)
    }
}

impl<V> Default for MemoryTierFactory<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TierFactory<K, V> for MemoryTierFactory<V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn local(&self, config: &CacheConfig) -> Arc<dyn LocalCache<K, CachedValue<V>>> {
        Arc::new(MokaLocalCache::from_config(config))
    }

    fn shared(&self, _config: &CacheConfig) -> Arc<dyn SharedCache<CachedValue<V>>> {
        self.shared.clone()
    }

    fn bus(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }
}

/// Tiers for a fleet: moka locally, Redis as shared tier and bus.
#[derive(Clone)]
pub struct RedisTierFactory {
    pool: Pool,
    bus: Arc<RedisEventBus>,
}

impl RedisTierFactory {
    pub fn new(pool: Pool, url: &str) -> Result<Self> {
        Ok(Self {
            bus: Arc::new(RedisEventBus::new(pool.clone(), url)?),
            pool,
        })
    }

    /// Build the pool, check the server answers and, if asked, turn on
    /// expiry notifications.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        tracing::info!(url = %config.url, "Connecting to Redis");
        let pool = create_pool(config)?;
        connection(&pool).await?;

        if config.enable_expiry_notifications {
            if let Err(e) = enable_expiry_notifications(&pool).await {
                tracing::warn!(
                    error = %e,
                    "Could not enable expiry notifications; local tiers rely on their own TTL"
                );
            }
        }

        tracing::info!("Connected to Redis");
        Self::new(pool, &config.url)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl<K, V> TierFactory<K, V> for RedisTierFactory
where
    K: CacheKey,
    V: CacheValue,
{
    fn local(&self, config: &CacheConfig) -> Arc<dyn LocalCache<K, CachedValue<V>>> {
        Arc::new(MokaLocalCache::from_config(config))
    }

    fn shared(&self, _config: &CacheConfig) -> Arc<dyn SharedCache<CachedValue<V>>> {
        Arc::new(RedisSharedCache::new(self.pool.clone()))
    }

    fn bus(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }
}

impl std::fmt::Debug for RedisTierFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTierFactory")
            .field("pool", &self.pool.status())
            .finish()
    }
}

/// Redis pool sized and timed from `config`
pub fn create_pool(config: &RedisConfig) -> Result<Pool> {
    let mut redis_config = deadpool_redis::Config::from_url(&config.url);
    if let Some(ref mut pool_config) = redis_config.pool {
        let timeout = Some(Duration::from_millis(config.timeout_ms));
        pool_config.max_size = config.pool_size;
        pool_config.timeouts.wait = timeout;
        pool_config.timeouts.create = timeout;
        pool_config.timeouts.recycle = timeout;
    }

    redis_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| Error::Configuration(format!("redis pool: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_pool_applies_size() {
        let config = RedisConfig {
            pool_size: 4,
            ..RedisConfig::default()
        };
        let pool = create_pool(&config).unwrap();
        assert_eq!(pool.status().max_size, 4);
    }

    #[tokio::test]
    async fn test_connect_fails_fast_without_server() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            timeout_ms: 200,
            ..RedisConfig::default()
        };
        let err = RedisTierFactory::connect(&config).await.unwrap_err();
        assert!(matches!(err, Error::TierUnavailable(_)));
    }

    #[test]
    fn test_memory_factory_shares_one_tier() {
        let factory: MemoryTierFactory<String> = MemoryTierFactory::new();
        let config = CacheConfig::new("users");

        let a = TierFactory::<String, String>::shared(&factory, &config);
        let b = TierFactory::<String, String>::shared(&factory, &config);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
