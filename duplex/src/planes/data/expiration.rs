use super::subscription::MessageHandler;
use super::tiers::Tiers;
use crate::domain::{CacheKey, CacheValue};
use crate::ports::BusMessage;
use async_trait::async_trait;
use std::sync::Arc;

/// Reacts to the shared store expiring a key on its own.
#[async_trait]
pub trait ExpirationHandler: Send + Sync + 'static {
    /// `key` is the full shared-store key, prefix included.
    async fn on_expire(&self, key: &str);
}

/// Drops the local copy of keys whose shared entry expired.
///
/// Every node receives the store's notification directly, so nothing is
/// published from here. Keys outside this cache's prefix are ignored.
pub struct ExpirationBridge<K, V> {
    tiers: Arc<Tiers<K, V>>,
}

impl<K, V> ExpirationBridge<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub(crate) fn new(tiers: Arc<Tiers<K, V>>) -> Self {
        Self { tiers }
    }
}

#[async_trait]
impl<K, V> ExpirationHandler for ExpirationBridge<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    async fn on_expire(&self, raw: &str) {
        let Some(key) = self.tiers.key_from_shared(raw) else {
            tracing::trace!(key = %raw, "Ignoring expiry for a foreign key");
            return;
        };

        let _guard = match self.tiers.lock(&key).await {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!(key = %raw, error = %e, "Evicting expired key without the lock");
                None
            }
        };

        self.tiers.local.evict(&key).await;
        tracing::debug!(cache = %self.tiers.name(), key = %raw, "Shared entry expired, local copy dropped");
    }
}

#[async_trait]
impl<K, V> MessageHandler for ExpirationBridge<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    async fn on_message(&self, message: BusMessage) {
        match std::str::from_utf8(&message.payload) {
            Ok(raw) => self.on_expire(raw).await,
            Err(e) => tracing::warn!(
                topic = %message.topic,
                error = %e,
                "Dropping expiry notification with a non UTF-8 key"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CachedValue, NodeId};
    use crate::ports::LocalCache;
    use crate::testing::{TestLocal, TestShared};
    use bytes::Bytes;
    use shared::config::CacheConfig;

    struct Fixture {
        bridge: ExpirationBridge<u64, String>,
        local: Arc<TestLocal<u64, CachedValue<String>>>,
        shared: Arc<TestShared<CachedValue<String>>>,
    }

    fn fixture(config: CacheConfig) -> Fixture {
        let local = Arc::new(TestLocal::new());
        let shared = Arc::new(TestShared::new());
        let tiers = Arc::new(Tiers::new(NodeId::random(), config, local.clone(), shared.clone()));
        Fixture {
            bridge: ExpirationBridge::new(tiers),
            local,
            shared,
        }
    }

    #[tokio::test]
    async fn expired_key_leaves_local_tier() {
        let f = fixture(CacheConfig::new("orders"));
        f.local.put(7, CachedValue::Present("a".into())).await;
        f.local.put(8, CachedValue::Present("b".into())).await;

        f.bridge.on_expire("orders::7").await;

        assert_eq!(f.local.get(&7).await, None);
        assert!(f.local.get(&8).await.is_some());
    }

    #[tokio::test]
    async fn keys_of_other_caches_are_ignored() {
        let f = fixture(CacheConfig::new("orders"));
        f.local.put(7, CachedValue::Present("a".into())).await;

        f.bridge.on_expire("users::7").await;
        f.bridge.on_expire("orders::not-a-number").await;

        assert!(f.local.get(&7).await.is_some());
    }

    #[tokio::test]
    async fn unprefixed_caches_take_the_raw_key() {
        let f = fixture(CacheConfig::new("orders").without_key_prefix());
        f.local.put(7, CachedValue::Present("a".into())).await;

        f.bridge
            .on_message(BusMessage {
                topic: "__keyevent@0__:expired".into(),
                payload: Bytes::from_static(b"7"),
            })
            .await;

        assert_eq!(f.local.get(&7).await, None);
    }

    #[tokio::test]
    async fn non_utf8_payload_is_dropped() {
        let f = fixture(CacheConfig::new("orders"));
        f.local.put(7, CachedValue::Present("a".into())).await;

        f.bridge
            .on_message(BusMessage {
                topic: "__keyevent@0__:expired".into(),
                payload: Bytes::from_static(&[0xff, 0xfe]),
            })
            .await;

        assert_eq!(f.local.len(), 1);
    }

    #[tokio::test]
    async fn shared_tier_is_left_alone() {
        let f = fixture(CacheConfig::new("orders"));
        f.local.put(7, CachedValue::Present("a".into())).await;
        f.shared.insert("orders::8", CachedValue::Present("b".into()));

        f.bridge.on_expire("orders::7").await;
        f.bridge.on_expire("orders::8").await;

        assert_eq!(f.local.len(), 0);
        assert_eq!(f.shared.reads(), 0);
        assert_eq!(f.shared.writes(), 0);
        assert_eq!(f.shared.evicts(), 0);
        assert_eq!(f.shared.peek("orders::8"), Some(CachedValue::Present("b".into())));
    }
}
