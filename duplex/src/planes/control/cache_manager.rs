use crate::domain::{CacheKey, CacheValue, NodeId};
use crate::planes::data::{Listeners, TwoTierCache};
use crate::ports::TierFactory;
use shared::config::CacheConfig;
use shared::{Error, Result};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A registered cache together with its running subscriptions
struct ManagedCache<K, V> {
    cache: TwoTierCache<K, V>,
    listeners: Option<Listeners>,
}

/// Registry of named two-tier caches, created on first use.
///
/// Every cache gets its tiers from the injected factory and its settings
/// from the manager's defaults under its own name. All caches of one manager
/// share the manager's node id.
pub struct CacheManager<K, V> {
    node: NodeId,
    defaults: CacheConfig,
    factory: Arc<dyn TierFactory<K, V>>,
    listen: bool,
    // Maps cache name -> cache and its listeners
    registry: Arc<RwLock<HashMap<String, ManagedCache<K, V>>>>,
}

impl<K, V> Clone for CacheManager<K, V> {
    fn clone(&self) -> Self {
        Self {
            node: self.node,
            defaults: self.defaults.clone(),
            factory: Arc::clone(&self.factory),
            listen: self.listen,
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<K, V> Debug for CacheManager<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("node", &self.node)
            .field("caches", &"<RwLock<HashMap>>")
            .finish()
    }
}

impl<K, V> CacheManager<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new(defaults: CacheConfig, factory: Arc<dyn TierFactory<K, V>>) -> Self {
        Self {
            node: NodeId::random(),
            defaults,
            factory,
            listen: true,
            registry: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Don't start coherence and expiration listeners for new caches
    pub fn without_listeners(mut self) -> Self {
        self.listen = false;
        self
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// Get the cache called `name`, creating (and starting) it if needed.
    pub async fn get_or_create(&self, name: &str) -> Result<TwoTierCache<K, V>> {
        if let Some(entry) = self.registry.read().await.get(name) {
            return Ok(entry.cache.clone());
        }

        let mut caches = self.registry.write().await;
        // Another task may have created it between the two locks
        if let Some(entry) = caches.get(name) {
            return Ok(entry.cache.clone());
        }

        let config = self.defaults.for_name(name);
        let cache = TwoTierCache::builder(config.clone())
            .node(self.node)
            .local(self.factory.local(&config))
            .shared(self.factory.shared(&config))
            .bus(self.factory.bus())
            .build()?;

        let listeners = if self.listen {
            Some(cache.listen().await?)
        } else {
            None
        };

        tracing::info!(cache = %name, node = %self.node, "Cache created");
        caches.insert(
            name.to_string(),
            ManagedCache {
                cache: cache.clone(),
                listeners,
            },
        );
        Ok(cache)
    }

    /// Get an existing cache by name
    pub async fn cache(&self, name: &str) -> Result<TwoTierCache<K, V>> {
        let caches = self.registry.read().await;
        caches
            .get(name)
            .map(|entry| entry.cache.clone())
            .ok_or_else(|| Error::CacheNotFound(name.to_string()))
    }

    pub async fn cache_names(&self) -> Vec<String> {
        let caches = self.registry.read().await;
        let mut names: Vec<String> = caches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Forget a cache and stop its listeners. Cached data is left in place.
    pub async fn drop_cache(&self, name: &str) -> bool {
        let removed = self.registry.write().await.remove(name);
        match removed {
            Some(entry) => {
                if let Some(listeners) = entry.listeners {
                    listeners.shutdown().await;
                }
                tracing::info!(cache = %name, "Cache dropped");
                true
            }
            None => false,
        }
    }

    /// Stop every cache's listeners and empty the registry.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, ManagedCache<K, V>)> =
            self.registry.write().await.drain().collect();

        for (name, entry) in drained {
            if let Some(listeners) = entry.listeners {
                listeners.shutdown().await;
            }
            tracing::debug!(cache = %name, "Cache stopped");
        }
        tracing::info!(node = %self.node, "Cache manager shut down");
    }
}
