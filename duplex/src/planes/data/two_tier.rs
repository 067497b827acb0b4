use super::expiration::ExpirationBridge;
use super::listener::CoherenceListener;
use super::subscription::{Listeners, spawn_subscription};
use super::tiers::Tiers;
use crate::domain::{CacheEvent, CacheKey, CacheValue, CachedValue, NodeId};
use crate::events::{BusEventPublisher, EventPublisher};
use crate::ports::{EventBus, LocalCache, SharedCache, escape_glob};
use shared::config::CacheConfig;
use shared::{Error, Result, TtlMs};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Two-tier cache façade: a fast local tier in front of a shared tier, kept
/// coherent across nodes by broadcasting every mutation.
///
/// Reads are served locally when possible and promote shared hits. Every
/// mutation of a key runs under that key's lock, writes the local tier, then
/// the shared tier, then publishes one event. Call [`TwoTierCache::listen`]
/// to apply the other nodes' events and the shared store's expirations.
pub struct TwoTierCache<K, V> {
    tiers: Arc<Tiers<K, V>>,
    publisher: Arc<dyn EventPublisher<K, V>>,
    bus: Arc<dyn EventBus>,
}

impl<K, V> Clone for TwoTierCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            tiers: Arc::clone(&self.tiers),
            publisher: Arc::clone(&self.publisher),
            bus: Arc::clone(&self.bus),
        }
    }
}

impl<K, V> std::fmt::Debug for TwoTierCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwoTierCache")
            .field("name", &self.tiers.config.name)
            .field("node", &self.tiers.node)
            .field("locks", &self.tiers.locks)
            .finish()
    }
}

impl<K, V> TwoTierCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn builder(config: CacheConfig) -> TwoTierCacheBuilder<K, V> {
        TwoTierCacheBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        self.tiers.name()
    }

    pub fn node_id(&self) -> NodeId {
        self.tiers.node
    }

    pub fn config(&self) -> &CacheConfig {
        &self.tiers.config
    }

    /// Read through both tiers.
    ///
    /// A local negative entry answers `None` without touching the shared
    /// tier. A shared hit is promoted into the local tier.
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        if let Some(slot) = self.tiers.local.get(key).await {
            tracing::trace!(cache = %self.name(), key = ?key, "Local hit");
            return Ok(slot.into_option());
        }

        let _guard = self.tiers.lock(key).await?;
        // Someone may have filled the local tier while we waited
        if let Some(slot) = self.tiers.local.get(key).await {
            return Ok(slot.into_option());
        }

        match self.tiers.shared.get(&self.tiers.shared_key(key)).await? {
            Some(slot) => {
                tracing::debug!(cache = %self.name(), key = ?key, "Shared hit, promoting");
                self.tiers.local.put(key.clone(), slot.clone()).await;
                Ok(slot.into_option())
            }
            None => {
                tracing::debug!(cache = %self.name(), key = ?key, "Miss");
                Ok(None)
            }
        }
    }

    /// Run `loader` and cache what it returns unless the key is already cached.
    ///
    /// The loader always runs. A loader failure is logged and reported as a
    /// miss; nothing is written in that case.
    pub async fn get_or_load<F, Fut, E>(&self, key: K, loader: F) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<Option<V>, E>>,
        E: Display,
    {
        let loaded = match loader().await {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(cache = %self.name(), key = ?key, error = %e, "Loader failed");
                return Ok(None);
            }
        };

        match loaded {
            Some(value) => {
                self.write_if_absent(key, CachedValue::Present(value.clone()))
                    .await?;
                Ok(Some(value))
            }
            None => {
                if self.tiers.config.cache_null_values {
                    self.write_if_absent(key, CachedValue::Null).await?;
                }
                Ok(None)
            }
        }
    }

    /// Whether either tier holds a value for `key`. Nothing is promoted.
    pub async fn contains(&self, key: &K) -> Result<bool> {
        Ok(matches!(self.lookup(key).await?, Some(CachedValue::Present(_))))
    }

    /// Write `value` to both tiers and tell the other nodes.
    ///
    /// The shared entry expires after `duration`, or the cache's default TTL.
    pub async fn put(&self, key: K, value: V, duration: Option<Duration>) -> Result<()> {
        self.write(key, CachedValue::Present(value), duration).await
    }

    /// Remove `key` from both tiers. Evicting an absent key changes nothing.
    pub async fn evict(&self, key: &K) -> Result<()> {
        let _guard = self.tiers.lock(key).await?;

        self.tiers.local.evict(key).await;
        let existed = self.tiers.shared.evict(&self.tiers.shared_key(key)).await?;
        tracing::debug!(cache = %self.name(), key = ?key, existed, "Evicted");

        self.publisher
            .publish(CacheEvent::evict_key(self.tiers.node, key.clone()))
            .await;
        Ok(())
    }

    /// Empty the local tier and every shared key of this cache.
    ///
    /// Not serialized against per-key writes: a `put` racing the clear may
    /// survive it.
    pub async fn clear(&self) -> Result<()> {
        self.tiers.local.clear().await;
        let removed = self.tiers.shared.clear(self.tiers.prefix()).await?;
        tracing::info!(cache = %self.name(), removed, "Cleared");

        self.publisher.publish(CacheEvent::clear(self.tiers.node)).await;
        Ok(())
    }

    /// Reload `key` from the shared tier on this and every other node.
    ///
    /// For entries written to the shared store by something other than this
    /// cache.
    pub async fn refresh(&self, key: &K) -> Result<Option<V>> {
        let _guard = self.tiers.lock(key).await?;

        let current = self.tiers.shared.get(&self.tiers.shared_key(key)).await?;
        match &current {
            Some(slot) => self.tiers.local.put(key.clone(), slot.clone()).await,
            None => self.tiers.local.evict(key).await,
        }

        self.publisher
            .publish(CacheEvent::update_key(self.tiers.node, key.clone(), None))
            .await;
        Ok(current.and_then(CachedValue::into_option))
    }

    /// Snapshot of the values held by this node's local tier.
    pub async fn entries(&self) -> HashMap<K, V> {
        self.tiers
            .local
            .entries()
            .await
            .into_iter()
            .filter_map(|(key, slot)| slot.into_option().map(|value| (key, value)))
            .collect()
    }

    /// Remaining shared-tier TTL of `key`
    pub async fn ttl(&self, key: &K) -> Result<Option<Duration>> {
        let ttl = self.tiers.shared.ttl(&self.tiers.shared_key(key)).await?;
        Ok(ttl.map(TtlMs::as_duration))
    }

    /// Reset the shared-tier TTL of `key`; `false` when the key is absent.
    pub async fn expire(&self, key: &K, duration: Duration) -> Result<bool> {
        let _guard = self.tiers.lock(key).await?;
        self.tiers
            .shared
            .expire(&self.tiers.shared_key(key), TtlMs::from(duration))
            .await
    }

    /// Start applying other nodes' events and the shared store's expirations.
    ///
    /// Both subscriptions are established before this returns; an error
    /// here means neither is running.
    pub async fn listen(&self) -> Result<Listeners> {
        let shutdown = CancellationToken::new();
        // Stops the coherence task again if the expiration subscription fails
        let abort = shutdown.clone().drop_guard();

        // The channel is a literal topic, not a pattern
        let coherence = spawn_subscription(
            Arc::clone(&self.bus),
            escape_glob(&self.tiers.config.channel),
            Arc::new(self.listener()),
            shutdown.clone(),
        )
        .await?;
        let expiration = spawn_subscription(
            Arc::clone(&self.bus),
            self.tiers.config.expiration_pattern.clone(),
            Arc::new(self.expiration_bridge()),
            shutdown.clone(),
        )
        .await?;

        abort.disarm();
        tracing::info!(
            cache = %self.name(),
            node = %self.tiers.node,
            channel = %self.tiers.config.channel,
            "Cache listening"
        );
        Ok(Listeners::new(shutdown, vec![coherence, expiration]))
    }

    /// Coherence listener over this cache's tiers, for custom transports
    pub fn listener(&self) -> CoherenceListener<K, V> {
        CoherenceListener::new(Arc::clone(&self.tiers))
    }

    /// Expiration bridge over this cache's tiers, for custom transports
    pub fn expiration_bridge(&self) -> ExpirationBridge<K, V> {
        ExpirationBridge::new(Arc::clone(&self.tiers))
    }

    async fn lookup(&self, key: &K) -> Result<Option<CachedValue<V>>> {
        if let Some(slot) = self.tiers.local.get(key).await {
            return Ok(Some(slot));
        }
        self.tiers.shared.get(&self.tiers.shared_key(key)).await
    }

    async fn write(&self, key: K, slot: CachedValue<V>, duration: Option<Duration>) -> Result<()> {
        let _guard = self.tiers.lock(&key).await?;
        self.store(key, slot, duration).await
    }

    /// Write `slot` unless the key already holds something at least as good:
    /// any value, or a negative entry when `slot` is itself negative.
    async fn write_if_absent(&self, key: K, slot: CachedValue<V>) -> Result<bool> {
        let _guard = self.tiers.lock(&key).await?;
        let occupied = match self.lookup(&key).await? {
            Some(CachedValue::Present(_)) => true,
            Some(CachedValue::Null) => slot.is_null(),
            None => false,
        };
        if occupied {
            tracing::trace!(cache = %self.name(), key = ?key, "Already cached, keeping current entry");
            return Ok(false);
        }

        self.store(key, slot, None).await?;
        Ok(true)
    }

    // Caller holds the key lock
    async fn store(&self, key: K, slot: CachedValue<V>, duration: Option<Duration>) -> Result<()> {
        let ttl = duration.or(self.tiers.config.ttl);

        self.tiers.local.put(key.clone(), slot.clone()).await;
        self.tiers
            .shared
            .put(&self.tiers.shared_key(&key), slot.clone(), ttl.map(TtlMs::from))
            .await?;
        tracing::debug!(cache = %self.name(), key = ?key, null = slot.is_null(), "Stored");

        self.publisher
            .publish(CacheEvent::put(self.tiers.node, key, slot.into_option(), ttl))
            .await;
        Ok(())
    }
}

/// Assembles a [`TwoTierCache`] from its tier capabilities.
///
/// The local tier, the shared tier and the bus are required. Without an
/// explicit publisher, events go to the bus on the configured channel.
pub struct TwoTierCacheBuilder<K, V> {
    config: CacheConfig,
    node: Option<NodeId>,
    local: Option<Arc<dyn LocalCache<K, CachedValue<V>>>>,
    shared: Option<Arc<dyn SharedCache<CachedValue<V>>>>,
    bus: Option<Arc<dyn EventBus>>,
    publisher: Option<Arc<dyn EventPublisher<K, V>>>,
}

impl<K, V> TwoTierCacheBuilder<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            node: None,
            local: None,
            shared: None,
            bus: None,
            publisher: None,
        }
    }

    pub fn node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn local(mut self, local: Arc<dyn LocalCache<K, CachedValue<V>>>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn shared(mut self, shared: Arc<dyn SharedCache<CachedValue<V>>>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher<K, V>>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn build(self) -> Result<TwoTierCache<K, V>> {
        let missing = |tier: &str| {
            Error::Configuration(format!("cache '{}' has no {}", self.config.name, tier))
        };
        let local = self.local.ok_or_else(|| missing("local tier"))?;
        let shared = self.shared.ok_or_else(|| missing("shared tier"))?;
        let bus = self.bus.ok_or_else(|| missing("event bus"))?;

        let publisher = match self.publisher {
            Some(publisher) => publisher,
            None => Arc::new(BusEventPublisher::new(
                Arc::clone(&bus),
                self.config.channel.clone(),
            )),
        };
        let node = self.node.unwrap_or_else(NodeId::random);

        Ok(TwoTierCache {
            tiers: Arc::new(Tiers::new(node, self.config, local, shared)),
            publisher,
            bus,
        })
    }
}
