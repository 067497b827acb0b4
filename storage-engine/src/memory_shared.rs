use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use duplex::ports::{EventBus, SharedCache};
use shared::{Result, TtlMs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Topic expirations are announced on, shaped like Redis keyevent notifications
pub const EXPIRED_TOPIC: &str = "__keyevent@0__:expired";

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Shared tier held in process memory.
///
/// Stands in for Redis when every node lives in one process. Entries expire
/// lazily on access and through [`MemorySharedCache::purge_expired`]; with a
/// notifier bus attached each expiry is announced on [`EXPIRED_TOPIC`] with
/// the key as payload.
pub struct MemorySharedCache<V> {
    entries: DashMap<String, Entry<V>>,
    notifier: Option<Arc<dyn EventBus>>,
}

impl<V> MemorySharedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            notifier: None,
        }
    }

    /// Announce expirations on `bus`
    pub fn with_notifier(bus: Arc<dyn EventBus>) -> Self {
        Self {
            entries: DashMap::new(),
            notifier: Some(bus),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry; returns how many went.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut purged = 0;
        for key in expired {
            if self.remove_if_expired(&key, now).await {
                purged += 1;
            }
        }
        purged
    }

    /// Purge on an interval until `shutdown` fires
    pub fn start_reaper(self: &Arc<Self>, every: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.purge_expired().await;
                        if purged > 0 {
                            tracing::debug!(purged, "Purged expired shared entries");
                        }
                    }
                }
            }
        })
    }

    async fn remove_if_expired(&self, key: &str, now: Instant) -> bool {
        if self.entries.remove_if(key, |_, entry| entry.is_expired(now)).is_none() {
            return false;
        }
        if let Some(bus) = &self.notifier {
            let payload = Bytes::copy_from_slice(key.as_bytes());
            if let Err(e) = bus.publish(EXPIRED_TOPIC, payload).await {
                tracing::warn!(key = %key, error = %e, "Failed to announce expiry");
            }
        }
        true
    }
}

impl<V> Default for MemorySharedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V> SharedCache<V> for MemorySharedCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        // The shard guard is released before removing
        if expired {
            self.remove_if_expired(key, now).await;
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: V, ttl: Option<TtlMs>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl.as_duration());
        self.entries.insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn evict(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn clear(&self, prefix: &str) -> Result<u64> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    async fn ttl(&self, key: &str) -> Result<Option<TtlMs>> {
        let now = Instant::now();
        Ok(self.entries.get(key).and_then(|entry| {
            entry
                .expires_at
                .filter(|at| *at > now)
                .map(|at| TtlMs::from(at - now))
        }))
    }

    async fn expire(&self, key: &str, ttl: TtlMs) -> Result<bool> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl.as_duration());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl<V> std::fmt::Debug for MemorySharedCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySharedCache")
            .field("entries", &self.entries.len())
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}
