use crate::domain::{CacheEvent, CacheKey, EventKind, NodeId};
use crate::ports::EventBus;
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shared::{Error, Result, TtlMs};
use std::marker::PhantomData;
use std::sync::Arc;

/// JSON shape of a `CacheEvent` on the coherence channel.
///
/// Keys travel as their token so they compare string-equal after decoding.
/// A `value` field that is present always means a value, even when it
/// serializes to `null`; an absent value leaves the field out.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(deserialize = "V: Deserialize<'de>"))]
struct WireEvent<V> {
    origin: NodeId,
    kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present",
        bound(deserialize = "V: Deserialize<'de>")
    )]
    value: Option<V>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u64>,
    #[serde(default)]
    timestamp: i64,
}

fn present<'de, D, V>(deserializer: D) -> std::result::Result<Option<V>, D::Error>
where
    D: serde::Deserializer<'de>,
    V: Deserialize<'de>,
{
    V::deserialize(deserializer).map(Some)
}

pub fn encode<K, V>(event: &CacheEvent<K, V>) -> Result<Vec<u8>>
where
    K: CacheKey,
    V: Serialize,
{
    let wire = WireEvent {
        origin: event.origin,
        kind: event.kind,
        key: event.key.as_ref().map(CacheKey::token),
        value: event.value.as_ref(),
        duration_ms: event.duration.map(|d| TtlMs::from(d).0),
        timestamp: event.timestamp,
    };
    serde_json::to_vec(&wire).map_err(|e| Error::Encode(format!("cache event: {}", e)))
}

pub fn decode<K, V>(payload: &[u8]) -> Result<CacheEvent<K, V>>
where
    K: CacheKey,
    V: DeserializeOwned,
{
    let wire: WireEvent<V> = serde_json::from_slice(payload)
        .map_err(|e| Error::Decode(format!("cache event: {}", e)))?;

    let key = match wire.key {
        Some(token) => Some(
            K::from_token(&token)
                .ok_or_else(|| Error::Decode(format!("unrecognised key token '{}'", token)))?,
        ),
        None if wire.kind.requires_key() => {
            return Err(Error::Decode(format!("{} event without a key", wire.kind)));
        }
        None => None,
    };

    Ok(CacheEvent {
        origin: wire.origin,
        kind: wire.kind,
        key,
        value: wire.value,
        duration: wire.duration_ms.map(|ms| TtlMs(ms).as_duration()),
        timestamp: wire.timestamp,
    })
}

/// Broadcasts local mutations to the other nodes.
///
/// Publishing is fire-and-forget: implementations log failures instead of
/// returning them, so a bus outage never fails a cache write.
#[async_trait]
pub trait EventPublisher<K, V>: Send + Sync + 'static {
    async fn publish(&self, event: CacheEvent<K, V>);
}

/// Default publisher: JSON-encodes events onto a single bus topic.
pub struct BusEventPublisher<K, V> {
    bus: Arc<dyn EventBus>,
    channel: String,
    _marker: PhantomData<fn(K, V)>,
}

impl<K, V> BusEventPublisher<K, V> {
    pub fn new(bus: Arc<dyn EventBus>, channel: impl Into<String>) -> Self {
        Self {
            bus,
            channel: channel.into(),
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<K, V> EventPublisher<K, V> for BusEventPublisher<K, V>
where
    K: CacheKey,
    V: Serialize + Send + Sync + 'static,
{
    async fn publish(&self, event: CacheEvent<K, V>) {
        let payload = match encode(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(kind = %event.kind, error = %e, "Dropping unencodable cache event");
                return;
            }
        };

        match self.bus.publish(&self.channel, Bytes::from(payload)).await {
            Ok(()) => tracing::debug!(
                channel = %self.channel,
                kind = %event.kind,
                key = ?event.key,
                "Published cache event"
            ),
            Err(e) => tracing::warn!(
                channel = %self.channel,
                kind = %event.kind,
                key = ?event.key,
                error = %e,
                "Failed to publish cache event"
            ),
        }
    }
}
