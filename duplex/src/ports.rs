use crate::domain::CachedValue;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use shared::config::CacheConfig;
use shared::{Result, TtlMs};
use std::collections::HashMap;
use std::sync::Arc;

// Ports are the pluggable capabilities the two-tier cache is built from

/// Bounded in-process cache, the fast tier.
#[async_trait]
pub trait LocalCache<K, V>: Send + Sync + 'static {
    async fn get(&self, key: &K) -> Option<V>;
    async fn put(&self, key: K, value: V);
    async fn evict(&self, key: &K);
    async fn clear(&self);
    async fn entries(&self) -> HashMap<K, V>;
}

/// Networked cache visible to every node.
///
/// Keys are full shared-store keys (prefix already applied). Failures to
/// reach the store are reported as `Error::TierUnavailable`.
#[async_trait]
pub trait SharedCache<V>: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<V>>;
    async fn put(&self, key: &str, value: V, ttl: Option<TtlMs>) -> Result<()>;
    /// Returns whether the key existed
    async fn evict(&self, key: &str) -> Result<bool>;
    /// Removes every key starting with `prefix` (all keys when empty)
    async fn clear(&self, prefix: &str) -> Result<u64>;
    /// Remaining TTL; `None` when the key is missing or never expires
    async fn ttl(&self, key: &str) -> Result<Option<TtlMs>>;
    /// Returns whether the key existed
    async fn expire(&self, key: &str, ttl: TtlMs) -> Result<bool>;
}

/// A message delivered by an `EventBus` subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    /// The concrete topic the message was published on
    pub topic: String,
    pub payload: Bytes,
}

pub type BusStream = BoxStream<'static, BusMessage>;

/// Publish/subscribe channel between nodes.
#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;

    /// Subscribe to every topic matching a glob `pattern` (`*`, `?` and `\\`
    /// escapes).
    ///
    /// The stream ends when the underlying connection is lost.
    async fn subscribe(&self, pattern: &str) -> Result<BusStream>;
}

/// Port for creating the tiers of a named cache from its configuration
pub trait TierFactory<K, V>: Send + Sync + 'static {
    fn local(&self, config: &CacheConfig) -> Arc<dyn LocalCache<K, CachedValue<V>>>;
    fn shared(&self, config: &CacheConfig) -> Arc<dyn SharedCache<CachedValue<V>>>;
    fn bus(&self) -> Arc<dyn EventBus>;
}

/// Redis-style glob match of a subscription pattern against a topic.
///
/// Supports `*` (any run, including empty), `?` (exactly one character) and
/// `\` to match the next character literally.
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let topic: Vec<char> = topic.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < topic.len() {
        let step = match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
                continue;
            }
            Some('\\') if p + 1 < pattern.len() => (pattern[p + 1] == topic[t]).then_some(2),
            Some(&c) => (c == '?' || c == topic[t]).then_some(1),
            None => None,
        };

        match (step, backtrack) {
            (Some(width), _) => {
                p += width;
                t += 1;
            }
            (None, Some((star, matched))) => {
                p = star + 1;
                t = matched + 1;
                backtrack = Some((star, matched + 1));
            }
            (None, None) => return false,
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Escape glob metacharacters so `raw` matches only itself as a pattern.
pub fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
