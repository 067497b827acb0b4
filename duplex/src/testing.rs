//! In-memory capability doubles for unit tests.

use crate::domain::CachedValue;
use crate::ports::{
    BusMessage, BusStream, EventBus, LocalCache, SharedCache, TierFactory, pattern_matches,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use shared::config::CacheConfig;
use shared::{Error, Result, TtlMs};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

pub struct TestLocal<K, V> {
    map: Mutex<HashMap<K, V>>,
}

impl<K, V> TestLocal<K, V> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}

#[async_trait]
impl<K, V> LocalCache<K, V> for TestLocal<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &K) -> Option<V> {
        self.map.lock().unwrap().get(key).cloned()
    }

    async fn put(&self, key: K, value: V) {
        self.map.lock().unwrap().insert(key, value);
    }

    async fn evict(&self, key: &K) {
        self.map.lock().unwrap().remove(key);
    }

    async fn clear(&self) {
        self.map.lock().unwrap().clear();
    }

    async fn entries(&self) -> HashMap<K, V> {
        self.map.lock().unwrap().clone()
    }
}

/// Shared tier double that counts reads and can simulate an outage.
pub struct TestShared<V> {
    map: Mutex<HashMap<String, (V, Option<TtlMs>)>>,
    available: AtomicBool,
    reads: AtomicUsize,
    writes: AtomicUsize,
    evicts: AtomicUsize,
    read_delay: Mutex<Option<Duration>>,
}

impl<V: Clone> TestShared<V> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            evicts: AtomicUsize::new(0),
            read_delay: Mutex::new(None),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn evicts(&self) -> usize {
        self.evicts.load(Ordering::SeqCst)
    }

    /// Makes every `get` take at least `delay`, like a slow network
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    /// Reads without counting and regardless of availability
    pub fn peek(&self, key: &str) -> Option<V> {
        self.map.lock().unwrap().get(key).map(|(v, _)| v.clone())
    }

    pub fn peek_ttl(&self, key: &str) -> Option<TtlMs> {
        self.map.lock().unwrap().get(key).and_then(|(_, ttl)| *ttl)
    }

    /// Writes behind the cache's back, as another application would
    pub fn insert(&self, key: &str, value: V) {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), (value, None));
    }

    /// Drops a key the way the store's own TTL would
    pub fn expire_now(&self, key: &str) {
        self.map.lock().unwrap().remove(key);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::TierUnavailable("shared tier offline".to_string()))
        }
    }
}

#[async_trait]
impl<V> SharedCache<V> for TestShared<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn get(&self, key: &str) -> Result<Option<V>> {
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.read_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.peek(key))
    }

    async fn put(&self, key: &str, value: V, ttl: Option<TtlMs>) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), (value, ttl));
        Ok(())
    }

    async fn evict(&self, key: &str) -> Result<bool> {
        self.check()?;
        self.evicts.fetch_add(1, Ordering::SeqCst);
        Ok(self.map.lock().unwrap().remove(key).is_some())
    }

    async fn clear(&self, prefix: &str) -> Result<u64> {
        self.check()?;
        let mut map = self.map.lock().unwrap();
        let before = map.len();
        map.retain(|key, _| !key.starts_with(prefix));
        Ok((before - map.len()) as u64)
    }

    async fn ttl(&self, key: &str) -> Result<Option<TtlMs>> {
        self.check()?;
        Ok(self.peek_ttl(key))
    }

    async fn expire(&self, key: &str, ttl: TtlMs) -> Result<bool> {
        self.check()?;
        let mut map = self.map.lock().unwrap();
        match map.get_mut(key) {
            Some(entry) => {
                entry.1 = Some(ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Broadcast bus double that counts publishes.
pub struct TestBus {
    sender: broadcast::Sender<BusMessage>,
    published: AtomicUsize,
    available: AtomicBool,
}

impl TestBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            sender,
            published: AtomicUsize::new(0),
            available: AtomicBool::new(true),
        }
    }

    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Delivers a message without counting it as a cache publish
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>) {
        let _ = self.sender.send(BusMessage {
            topic: topic.to_string(),
            payload: payload.into(),
        });
    }
}

#[async_trait]
impl EventBus for TestBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::TierUnavailable("bus offline".to_string()));
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<BusStream> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::TierUnavailable("bus offline".to_string()));
        }
        let pattern = pattern.to_string();
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(move |message| {
            let delivered = match message {
                Ok(message) if pattern_matches(&pattern, &message.topic) => Some(message),
                _ => None,
            };
            futures::future::ready(delivered)
        });
        Ok(stream.boxed())
    }
}

/// Factory handing every cache a fresh local tier over one shared tier and bus.
pub struct TestFactory<V> {
    pub shared: Arc<TestShared<CachedValue<V>>>,
    pub bus: Arc<TestBus>,
}

impl<V: Clone> TestFactory<V> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TestShared::new()),
            bus: Arc::new(TestBus::new()),
        }
    }
}

impl<K, V> TierFactory<K, V> for TestFactory<V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn local(
        &self,
        _config: &CacheConfig,
    ) -> Arc<dyn LocalCache<K, CachedValue<V>>> {
        Arc::new(TestLocal::new())
    }

    fn shared(
        &self,
        _config: &CacheConfig,
    ) -> Arc<dyn SharedCache<CachedValue<V>>> {
        self.shared.clone()
    }

    fn bus(&self) -> Arc<dyn EventBus> {
        self.bus.clone()
    }
}
