// shared/src/lib.rs

use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("encode: {0}")]
    Encode(String),
    #[error("tier unavailable: {0}")]
    TierUnavailable(String),
    #[error("timed out waiting for lock on '{0}'")]
    LockTimeout(String),
    #[error("cache not found: {0}")]
    CacheNotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Time-to-live in milliseconds, the unit used on the wire and by the shared tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TtlMs(pub u64);

impl TtlMs {
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl From<Duration> for TtlMs {
    fn from(duration: Duration) -> Self {
        // Saturate instead of truncating silently on absurd durations
        TtlMs(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }
}

pub mod config;
