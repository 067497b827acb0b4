use crate::domain::{CacheKey, CachedValue, NodeId};
use crate::lock::{KeyGuard, KeyLocks};
use crate::ports::{LocalCache, SharedCache};
use shared::Result;
use shared::config::CacheConfig;
use std::sync::Arc;

/// State shared by a cache's façade, coherence listener and expiration bridge.
pub(crate) struct Tiers<K, V> {
    pub node: NodeId,
    pub config: CacheConfig,
    pub local: Arc<dyn LocalCache<K, CachedValue<V>>>,
    pub shared: Arc<dyn SharedCache<CachedValue<V>>>,
    pub locks: KeyLocks,
    prefix: String,
}

impl<K: CacheKey, V> Tiers<K, V> {
    pub fn new(
        node: NodeId,
        config: CacheConfig,
        local: Arc<dyn LocalCache<K, CachedValue<V>>>,
        shared: Arc<dyn SharedCache<CachedValue<V>>>,
    ) -> Self {
        Self {
            node,
            prefix: config.shared_prefix(),
            config,
            local,
            shared,
            locks: KeyLocks::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full shared-store key, also used as the lock token
    pub fn shared_key(&self, key: &K) -> String {
        format!("{}{}", self.prefix, key.token())
    }

    /// Inverse of `shared_key`; `None` for keys that belong to someone else
    pub fn key_from_shared(&self, raw: &str) -> Option<K> {
        raw.strip_prefix(self.prefix.as_str())
            .and_then(K::from_token)
    }

    pub async fn lock(&self, key: &K) -> Result<KeyGuard> {
        let token = self.shared_key(key);
        match self.config.lock_timeout {
            Some(timeout) => self.locks.acquire_timeout(&token, timeout).await,
            None => Ok(self.locks.acquire(&token).await),
        }
    }
}
