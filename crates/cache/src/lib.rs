//! In-memory result cache with TTL expiry and bounded size.
//!
//! [`CacheManager`] is a cheap-to-clone handle; every clone sees the same
//! entries. Expired entries are dropped lazily on access, by
//! [`CacheManager::purge_expired`], or by a background sweeper started with
//! [`CacheManager::start_sweeper`].

pub mod config;
pub mod manager;
pub mod pattern;
pub mod sweeper;

pub use config::{CacheConfig, EvictionStrategy, SetOptions, Ttl};
pub use manager::{CacheManager, CacheStats};
pub use pattern::{Pattern, PatternError};
pub use sweeper::SweeperHandle;
