use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which entry is evicted when a new key arrives at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategy {
    /// Least recently used.
    #[default]
    Lru,
    /// Nearest expiry first; entries that never expire go last.
    Ttl,
    /// Least frequently used.
    Lfu,
}

/// Lifetime requested for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ttl {
    /// The cache's configured default TTL.
    #[default]
    Default,
    /// Never expires.
    Never,
    /// Expires after the given duration. A zero duration means [`Ttl::Default`].
    After(Duration),
}

impl Ttl {
    /// Resolve against the cache default. `None` means no expiry.
    pub fn resolve(self, default_ttl: Duration) -> Option<Duration> {
        match self {
            Ttl::Default => Some(default_ttl),
            Ttl::After(d) if d.is_zero() => Some(default_ttl),
            Ttl::After(d) => Some(d),
            Ttl::Never => None,
        }
    }
}

impl From<Duration> for Ttl {
    fn from(value: Duration) -> Self {
        Ttl::After(value)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    pub ttl: Ttl,
}

impl SetOptions {
    pub fn ttl(ttl: impl Into<Ttl>) -> Self {
        Self { ttl: ttl.into() }
    }
}

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries (at least 1).
    pub max_size: usize,
    pub default_ttl: Duration,
    pub strategy: EvictionStrategy,
    /// Period of the background sweeper.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl: Duration::from_secs(60 * 60),
            strategy: EvictionStrategy::Lru,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_strategy(mut self, strategy: EvictionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}
