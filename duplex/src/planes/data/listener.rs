use super::subscription::MessageHandler;
use super::tiers::Tiers;
use crate::domain::{CacheEvent, CacheKey, CacheValue, CachedValue, EventKind};
use crate::events::decode;
use crate::lock::KeyGuard;
use crate::ports::BusMessage;
use async_trait::async_trait;
use std::sync::Arc;

/// Applies coherence events published by other nodes.
#[async_trait]
pub trait CoherenceHandler<K, V>: Send + Sync + 'static {
    async fn on_coherence_event(&self, event: CacheEvent<K, V>);
}

/// Replays remote mutations onto this node's tiers.
///
/// It holds no publisher: applying a received event can never cause another
/// broadcast. Events carrying this node's own id are ignored, since a bus
/// subscriber also receives what it publishes.
pub struct CoherenceListener<K, V> {
    tiers: Arc<Tiers<K, V>>,
}

impl<K, V> CoherenceListener<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub(crate) fn new(tiers: Arc<Tiers<K, V>>) -> Self {
        Self { tiers }
    }

    async fn lock(&self, key: &K) -> Option<KeyGuard> {
        match self.tiers.lock(key).await {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!(
                    cache = %self.tiers.name(),
                    key = ?key,
                    error = %e,
                    "Applying remote event without the key lock"
                );
                None
            }
        }
    }

    async fn apply_put(&self, key: K, value: Option<V>) {
        let Some(_guard) = self.lock(&key).await else {
            // Without the lock only dropping the entry is safe; the next read repairs it
            self.tiers.local.evict(&key).await;
            return;
        };

        match value {
            Some(value) => self.tiers.local.put(key, CachedValue::Present(value)).await,
            None if self.tiers.config.cache_null_values => {
                self.tiers.local.put(key, CachedValue::Null).await
            }
            None => self.tiers.local.evict(&key).await,
        }
    }

    async fn apply_update(&self, key: K, value: Option<V>) {
        if value.is_some() {
            return self.apply_put(key, value).await;
        }

        let Some(_guard) = self.lock(&key).await else {
            self.tiers.local.evict(&key).await;
            return;
        };

        match self.tiers.shared.get(&self.tiers.shared_key(&key)).await {
            Ok(Some(slot)) => self.tiers.local.put(key, slot).await,
            Ok(None) => self.tiers.local.evict(&key).await,
            Err(e) => {
                tracing::warn!(
                    cache = %self.tiers.name(),
                    key = ?key,
                    error = %e,
                    "Could not refresh from shared tier, dropping local entry"
                );
                self.tiers.local.evict(&key).await;
            }
        }
    }

    async fn apply_evict(&self, key: K, include_shared: bool) {
        let _guard = self.lock(&key).await;
        self.tiers.local.evict(&key).await;

        if include_shared {
            let shared_key = self.tiers.shared_key(&key);
            if let Err(e) = self.tiers.shared.evict(&shared_key).await {
                tracing::warn!(
                    cache = %self.tiers.name(),
                    key = ?key,
                    error = %e,
                    "Remote EVICT_ALL could not reach shared tier"
                );
            }
        }
    }
}

#[async_trait]
impl<K, V> CoherenceHandler<K, V> for CoherenceListener<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    async fn on_coherence_event(&self, event: CacheEvent<K, V>) {
        if event.origin == self.tiers.node {
            tracing::trace!(kind = %event.kind, "Ignoring own cache event");
            return;
        }

        tracing::debug!(
            cache = %self.tiers.name(),
            kind = %event.kind,
            key = ?event.key,
            origin = %event.origin,
            "Applying remote cache event"
        );

        let CacheEvent { kind, key, value, .. } = event;
        match (kind, key) {
            (EventKind::Clear, _) => self.tiers.local.clear().await,
            (kind, None) => {
                tracing::warn!(kind = %kind, "Dropping keyed cache event without a key");
            }
            (EventKind::Put, Some(key)) => self.apply_put(key, value).await,
            (EventKind::UpdateKey, Some(key)) => self.apply_update(key, value).await,
            (EventKind::EvictKey, Some(key)) => self.apply_evict(key, false).await,
            (EventKind::EvictAll, Some(key)) => self.apply_evict(key, true).await,
        }
    }
}

#[async_trait]
impl<K, V> MessageHandler for CoherenceListener<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    async fn on_message(&self, message: BusMessage) {
        match decode::<K, V>(&message.payload) {
            Ok(event) => self.on_coherence_event(event).await,
            Err(e) => tracing::warn!(
                topic = %message.topic,
                error = %e,
                "Dropping undecodable cache event"
            ),
        }
    }
}
