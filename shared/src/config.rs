use std::time::Duration;
use tracing::warn;

/// Settings for one named two-tier cache.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub name: String,
    /// Shared-tier TTL applied when `put` is not given one explicitly
    pub ttl: Option<Duration>,
    /// Prepended (before the cache name) to every shared-store key
    pub key_prefix: Option<String>,
    pub use_key_prefix: bool,
    /// Whether absent load results populate a negative entry
    pub cache_null_values: bool,
    pub local_max_capacity: Option<u64>,
    pub local_ttl: Option<Duration>,
    /// `None` waits for a key lock indefinitely
    pub lock_timeout: Option<Duration>,
    /// Coherence topic events for this cache are published on
    pub channel: String,
    /// Pattern of the shared store's native key-expired notifications
    pub expiration_pattern: String,
}

impl CacheConfig {
    pub const DEFAULT_NAME: &str = "default";
    pub const DEFAULT_CHANNEL_PREFIX: &str = "duplex:cache:";
    pub const DEFAULT_EXPIRATION_PATTERN: &str = "__keyevent@*__:expired";
    const DEFAULT_LOCAL_MAX_CAPACITY: u64 = 10_000;

    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            channel: format!("{}{}", Self::DEFAULT_CHANNEL_PREFIX, name),
            name,
            ttl: None,
            key_prefix: None,
            use_key_prefix: true,
            cache_null_values: false,
            local_max_capacity: Some(Self::DEFAULT_LOCAL_MAX_CAPACITY),
            local_ttl: None,
            lock_timeout: None,
            expiration_pattern: Self::DEFAULT_EXPIRATION_PATTERN.to_string(),
        }
    }

    /// Same settings under another cache name, with the channel renamed to match
    pub fn for_name(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            channel: format!("{}{}", Self::DEFAULT_CHANNEL_PREFIX, name),
            ..self.clone()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self.use_key_prefix = true;
        self
    }

    pub fn without_key_prefix(mut self) -> Self {
        self.use_key_prefix = false;
        self
    }

    pub fn with_null_values(mut self, cache_null_values: bool) -> Self {
        self.cache_null_values = cache_null_values;
        self
    }

    pub fn with_local_capacity(mut self, max_entries: u64) -> Self {
        self.local_max_capacity = Some(max_entries);
        self
    }

    pub fn with_local_ttl(mut self, ttl: Duration) -> Self {
        self.local_ttl = Some(ttl);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Prefix every shared-store key of this cache starts with.
    ///
    /// `key_prefix + name + "::"` when prefixing is on, empty otherwise.
    pub fn shared_prefix(&self) -> String {
        if !self.use_key_prefix {
            return String::new();
        }
        format!(
            "{}{}::",
            self.key_prefix.as_deref().unwrap_or_default(),
            self.name
        )
    }

    pub fn from_env() -> Self {
        let name = std::env::var("DUPLEX_CACHE_NAME")
            .unwrap_or_else(|_| Self::DEFAULT_NAME.to_string());
        let mut config = Self::new(name);

        config.ttl = env_millis("DUPLEX_CACHE_TTL_MS");
        config.key_prefix = std::env::var("DUPLEX_KEY_PREFIX").ok();
        config.use_key_prefix = env_flag("DUPLEX_USE_KEY_PREFIX", true);
        config.cache_null_values = env_flag("DUPLEX_CACHE_NULL_VALUES", false);
        if let Some(capacity) = env_parse::<u64>("DUPLEX_LOCAL_MAX_CAPACITY") {
            config.local_max_capacity = (capacity > 0).then_some(capacity);
        }
        config.local_ttl = env_millis("DUPLEX_LOCAL_TTL_MS");
        config.lock_timeout = env_millis("DUPLEX_LOCK_TIMEOUT_MS");
        if let Ok(channel) = std::env::var("DUPLEX_CHANNEL") {
            config.channel = channel;
        }
        if let Ok(pattern) = std::env::var("DUPLEX_EXPIRATION_PATTERN") {
            config.expiration_pattern = pattern;
        }
        config
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NAME)
    }
}

/// Connection settings for the Redis shared tier and bus.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: usize,
    pub timeout_ms: u64,
    /// Turn on `notify-keyspace-events Ex` at startup
    pub enable_expiry_notifications: bool,
}

impl RedisConfig {
    const DEFAULT_URL: &str = "redis://127.0.0.1:6379";
    const DEFAULT_POOL_SIZE: usize = 16;
    const DEFAULT_TIMEOUT_MS: u64 = 5000;

    pub fn from_env() -> Self {
        Self {
            url: std::env::var("DUPLEX_REDIS_URL").unwrap_or_else(|_| {
                warn!(
                    "DUPLEX_REDIS_URL not set, using {}",
                    Self::DEFAULT_URL
                );
                Self::DEFAULT_URL.to_string()
            }),
            pool_size: env_parse("DUPLEX_REDIS_POOL_SIZE").unwrap_or(Self::DEFAULT_POOL_SIZE),
            timeout_ms: env_parse("DUPLEX_REDIS_TIMEOUT_MS").unwrap_or(Self::DEFAULT_TIMEOUT_MS),
            enable_expiry_notifications: env_flag("DUPLEX_REDIS_NOTIFY_EXPIRED", true),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: Self::DEFAULT_URL.to_string(),
            pool_size: Self::DEFAULT_POOL_SIZE,
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            enable_expiry_notifications: true,
        }
    }
}

/// Everything a node process needs at startup.
#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    pub cache: CacheConfig,
    pub redis: RedisConfig,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        Self {
            cache: CacheConfig::from_env(),
            redis: RedisConfig::from_env(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable value '{}' for {}", raw, name);
            None
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
