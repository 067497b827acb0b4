//! Tier adapters for the two-tier cache: moka for the local tier, Redis or
//! process memory for the shared tier and the event bus.

pub mod factory;
pub mod memory_bus;
pub mod memory_shared;
pub mod moka_cache;
pub mod redis_bus;
pub mod redis_cache;

pub use factory::{MemoryTierFactory, RedisTierFactory, create_pool};
pub use memory_bus::MemoryEventBus;
pub use memory_shared::{EXPIRED_TOPIC, MemorySharedCache};
pub use moka_cache::MokaLocalCache;
pub use redis_bus::RedisEventBus;
pub use redis_cache::{RedisSharedCache, enable_expiry_notifications};
