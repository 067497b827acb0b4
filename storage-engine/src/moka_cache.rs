use async_trait::async_trait;
use duplex::ports::LocalCache;
use moka::future::Cache;
use shared::config::CacheConfig;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

/// Moka-based local tier
/// Lock-free, concurrent, with optional size bound and time-to-live
pub struct MokaLocalCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache: Cache<K, V>,
}

impl<K, V> MokaLocalCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a Moka cache from name, optional capacity and optional TTL
    pub fn new(name: &str, max_entries: Option<u64>, ttl: Option<Duration>) -> Self {
        let mut builder = Cache::builder().name(name);

        if let Some(capacity) = max_entries {
            builder = builder.max_capacity(capacity);
        }

        if let Some(ttl) = ttl {
            builder = builder.time_to_live(ttl);
        }

        Self {
            cache: builder.build(),
        }
    }

    /// Sized and timed from the cache's local-tier settings
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(&config.name, config.local_max_capacity, config.local_ttl)
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Apply pending evictions so counts are exact
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}

#[async_trait]
impl<K, V> LocalCache<K, V> for MokaLocalCache<K, V>
where
    K: Clone + Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Option<V> {
        // None when absent or past the local TTL
        self.cache.get(key).await
    }

    async fn put(&self, key: K, value: V) {
        self.cache.insert(key, value).await;
    }

    async fn evict(&self, key: &K) {
        self.cache.invalidate(key).await;
    }

    async fn clear(&self) {
        self.cache.invalidate_all();
    }

    async fn entries(&self) -> HashMap<K, V> {
        self.cache
            .iter()
            .map(|(key, value)| (K::clone(&key), value))
            .collect()
    }
}

impl<K, V> Debug for MokaLocalCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MokaLocalCache")
            .field("name", &self.cache.name())
            .field("entry_count", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_put_and_get() {
        let cache = MokaLocalCache::new("test", None, None);

        cache.put("hello", "world").await;
        assert_eq!(cache.get(&"hello").await, Some("world"));
        assert_eq!(cache.get(&"missing").await, None);
    }

    #[tokio::test]
    async fn test_overwrite_and_evict() {
        let cache = MokaLocalCache::new("test", None, None);

        cache.put("key", "value1").await;
        cache.put("key", "value2").await;
        assert_eq!(cache.get(&"key").await, Some("value2"));

        cache.evict(&"key").await;
        assert_eq!(cache.get(&"key").await, None);

        // Evicting again is harmless
        cache.evict(&"key").await;
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = MokaLocalCache::new("test", None, None);
        cache.put(1u64, "a").await;
        cache.put(2u64, "b").await;

        cache.clear().await;

        assert_eq!(cache.get(&1).await, None);
        assert_eq!(cache.get(&2).await, None);
    }

    #[tokio::test]
    async fn test_entries_snapshot() {
        let cache = MokaLocalCache::new("test", None, None);
        cache.put("a".to_string(), 1).await;
        cache.put("b".to_string(), 2).await;

        let entries = cache.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.get("b"), Some(&2));
    }

    #[tokio::test]
    async fn test_local_ttl() {
        let config = CacheConfig::new("test").with_local_ttl(Duration::from_millis(100));
        let cache = MokaLocalCache::from_config(&config);

        cache.put("key", "value").await;
        assert_eq!(cache.get(&"key").await, Some("value"));

        sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.get(&"key").await, None);
    }

    #[tokio::test]
    async fn test_bounded() {
        let cache = MokaLocalCache::new("test", Some(2), None);

        cache.put("key1", "value1").await;
        cache.put("key2", "value2").await;
        cache.put("key3", "value3").await;
        cache.sync().await;

        assert!(cache.entry_count() <= 2, "Cache should have at most 2 entries");
    }
}
