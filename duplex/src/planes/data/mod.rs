//! Data plane: the two-tier façade and the two subscriptions that keep a
//! node's local tier coherent with the rest of the fleet.

pub mod expiration;
pub mod listener;
pub mod subscription;
pub(crate) mod tiers;
pub mod two_tier;

pub use expiration::{ExpirationBridge, ExpirationHandler};
pub use listener::{CoherenceHandler, CoherenceListener};
pub use subscription::{Listeners, MessageHandler};
pub use two_tier::{TwoTierCache, TwoTierCacheBuilder};
