use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::time::Duration;
use uuid::Uuid;

/// A key that can be stored in both tiers.
///
/// `token` is the stable string form used as the lock token, as the suffix of
/// the shared-store key and on the wire. Equal keys must produce equal tokens
/// and `from_token(k.token())` must give back `k`.
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    fn token(&self) -> String;
    fn from_token(token: &str) -> Option<Self>;
}

impl CacheKey for String {
    fn token(&self) -> String {
        self.clone()
    }

    fn from_token(token: &str) -> Option<Self> {
        Some(token.to_string())
    }
}

impl CacheKey for u64 {
    fn token(&self) -> String {
        self.to_string()
    }

    fn from_token(token: &str) -> Option<Self> {
        token.parse().ok()
    }
}

impl CacheKey for i64 {
    fn token(&self) -> String {
        self.to_string()
    }

    fn from_token(token: &str) -> Option<Self> {
        token.parse().ok()
    }
}

impl CacheKey for Uuid {
    fn token(&self) -> String {
        self.hyphenated().to_string()
    }

    fn from_token(token: &str) -> Option<Self> {
        Uuid::parse_str(token).ok()
    }
}

/// A value that can be stored in both tiers and carried on the wire.
pub trait CacheValue: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> CacheValue for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// What a tier actually holds for a key.
///
/// `Null` is a negative entry: the key is known to have no value. It is only
/// written when null caching is enabled for the cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum CachedValue<V> {
    Present(V),
    Null,
}

impl<V> CachedValue<V> {
    pub fn into_option(self) -> Option<V> {
        match self {
            CachedValue::Present(value) => Some(value),
            CachedValue::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CachedValue::Null)
    }
}

/// Identity of one cooperating process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    pub fn random() -> Self {
        NodeId(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::random()
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The kind of mutation a coherence event replays on the receiving node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    /// Write the carried value into the local tier
    Put,
    /// Drop the key from the local tier
    EvictKey,
    /// Drop the key from the local and the shared tier
    EvictAll,
    /// Drop every local entry
    Clear,
    /// Reload the key from the shared tier (or take the carried value)
    UpdateKey,
}

impl EventKind {
    /// Every kind except `Clear` is about a single key.
    pub fn requires_key(self) -> bool {
        !matches!(self, EventKind::Clear)
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Put => "PUT",
            EventKind::EvictKey => "EVICT_KEY",
            EventKind::EvictAll => "EVICT_ALL",
            EventKind::Clear => "CLEAR",
            EventKind::UpdateKey => "UPDATE_KEY",
        };
        f.write_str(name)
    }
}

/// A mutation broadcast so every other node's local tier converges.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEvent<K, V> {
    pub origin: NodeId,
    pub kind: EventKind,
    pub key: Option<K>,
    pub value: Option<V>,
    pub duration: Option<Duration>,
    /// Milliseconds since the UNIX epoch at the publishing node
    pub timestamp: i64,
}

impl<K, V> CacheEvent<K, V> {
    fn new(origin: NodeId, kind: EventKind, key: Option<K>) -> Self {
        Self {
            origin,
            kind,
            key,
            value: None,
            duration: None,
            timestamp: now_millis(),
        }
    }

    pub fn put(origin: NodeId, key: K, value: Option<V>, duration: Option<Duration>) -> Self {
        Self {
            value,
            duration,
            ..Self::new(origin, EventKind::Put, Some(key))
        }
    }

    pub fn evict_key(origin: NodeId, key: K) -> Self {
        Self::new(origin, EventKind::EvictKey, Some(key))
    }

    pub fn evict_all(origin: NodeId, key: K) -> Self {
        Self::new(origin, EventKind::EvictAll, Some(key))
    }

    pub fn clear(origin: NodeId) -> Self {
        Self::new(origin, EventKind::Clear, None)
    }

    pub fn update_key(origin: NodeId, key: K, value: Option<V>) -> Self {
        Self {
            value,
            ..Self::new(origin, EventKind::UpdateKey, Some(key))
        }
    }
}

/// Current time in milliseconds since the UNIX epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_tokens_round_trip() {
        let id = Uuid::new_v4();
        assert_eq!(Uuid::from_token(&id.token()), Some(id));
        assert_eq!(u64::from_token(&42u64.token()), Some(42));
        assert_eq!(i64::from_token(&(-7i64).token()), Some(-7));
        assert_eq!(String::from_token("user:1"), Some("user:1".to_string()));
        assert_eq!(u64::from_token("not-a-number"), None);
    }

    #[test]
    fn cached_value_into_option() {
        assert_eq!(CachedValue::Present("a").into_option(), Some("a"));
        assert_eq!(CachedValue::<i32>::Null.into_option(), None);
        assert!(CachedValue::<i32>::Null.is_null());
    }

    #[test]
    fn only_clear_is_keyless() {
        assert!(!EventKind::Clear.requires_key());
        assert!(EventKind::Put.requires_key());
        assert!(EventKind::EvictAll.requires_key());
    }

    #[test]
    fn constructors_set_kind() {
        let node = NodeId::random();
        let put: CacheEvent<String, i32> =
            CacheEvent::put(node, "k".into(), Some(1), Some(Duration::from_secs(5)));
        assert_eq!(put.kind, EventKind::Put);
        assert_eq!(put.duration, Some(Duration::from_secs(5)));

        let clear: CacheEvent<String, i32> = CacheEvent::clear(node);
        assert_eq!(clear.kind, EventKind::Clear);
        assert!(clear.key.is_none());
        assert_eq!(clear.origin, node);
    }
}
