//! Two-tier coherent cache.
//!
//! A bounded in-process tier sits in front of a shared networked tier. Every
//! mutation is broadcast on an event bus so the other nodes' local tiers
//! follow, and the shared store's own expirations are mirrored locally.

pub mod domain;
pub mod events;
pub mod lock;
pub mod planes;
pub mod ports;

#[cfg(test)]
mod testing;

pub use domain::{CacheEvent, CacheKey, CacheValue, CachedValue, EventKind, NodeId};
pub use events::{BusEventPublisher, EventPublisher};
pub use lock::{KeyGuard, KeyLocks};
pub use planes::control::CacheManager;
pub use planes::data::{
    CoherenceHandler, CoherenceListener, ExpirationBridge, ExpirationHandler, Listeners,
    MessageHandler, TwoTierCache, TwoTierCacheBuilder,
};
pub use ports::{BusMessage, BusStream, EventBus, LocalCache, SharedCache, TierFactory};
