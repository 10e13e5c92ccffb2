use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::config::{CacheConfig, EvictionStrategy, SetOptions, Ttl};
use crate::pattern::Pattern;
use crate::sweeper::{self, SweeperHandle};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    accessed_at: Instant,
    expires_at: Option<Instant>,
    access_count: u64,
    estimated_size: usize,
    /// Insertion order; breaks eviction ties.
    seq: u64,
    /// Logical clock of the last access; drives LRU.
    tick: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    sets: u64,
    evictions: u64,
    expirations: u64,
}

#[derive(Debug)]
struct State<V> {
    entries: HashMap<String, CacheEntry<V>>,
    next_seq: u64,
    clock: u64,
    counters: Counters,
}

impl<V> State<V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Drop `key` if it has expired. Returns `true` when it was removed.
    fn expire_if_due(&mut self, key: &str, now: Instant) -> bool {
        let expired = self.entries.get(key).is_some_and(|e| e.is_expired(now));
        if expired {
            self.entries.remove(key);
            self.counters.expirations += 1;
        }
        expired
    }

    fn victim(&self, strategy: EvictionStrategy) -> Option<String> {
        let entries = self.entries.iter();
        let victim = match strategy {
            EvictionStrategy::Lru => entries.min_by_key(|(_, e)| (e.tick, e.seq)),
            EvictionStrategy::Lfu => entries.min_by_key(|(_, e)| (e.access_count, e.seq)),
            EvictionStrategy::Ttl => {
                entries.min_by_key(|(_, e)| (e.expires_at.is_none(), e.expires_at, e.seq))
            }
        };
        victim.map(|(key, _)| key.clone())
    }
}

pub(crate) struct Shared<V> {
    config: CacheConfig,
    state: Mutex<State<V>>,
    /// Sweeper owned by the cache itself; stops when the last clone drops.
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl<V> Shared<V> {
    fn lock(&self) -> MutexGuard<'_, State<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|_, e| !e.is_expired(now));
        let removed = before - state.entries.len();
        state.counters.expirations += removed as u64;
        removed
    }
}

/// Snapshot of cache counters and occupancy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub max_size: usize,
    pub total_bytes: usize,
    #[serde(serialize_with = "millis")]
    pub oldest_age: Option<Duration>,
    #[serde(serialize_with = "millis")]
    pub newest_age: Option<Duration>,
    /// `hits / (hits + misses)`, 0 when nothing was looked up.
    pub hit_ratio: f64,
}

fn millis<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    value
        .map(|d| d.as_millis() as u64)
        .serialize(serializer)
}

/// Shared, bounded key/value cache.
pub struct CacheManager<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for CacheManager<V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V> std::fmt::Debug for CacheManager<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.shared.config)
            .field("size", &self.shared.lock().entries.len())
            .finish()
    }
}

impl<V: Clone + Serialize + Send + 'static> Default for CacheManager<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<V: Clone + Serialize + Send + 'static> CacheManager<V> {
    pub fn new(config: CacheConfig) -> Self {
        let config = CacheConfig {
            max_size: config.max_size.max(1),
            ..config
        };
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State {
                    entries: HashMap::new(),
                    next_seq: 0,
                    clock: 0,
                    counters: Counters::default(),
                }),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Insert or replace `key`.
    ///
    /// Inserting a new key into a full cache evicts exactly one entry first.
    /// Replacing an existing key never evicts.
    pub fn set(&self, key: impl Into<String>, value: V, options: SetOptions) {
        let key = key.into();
        let now = Instant::now();
        let expires_at = options
            .ttl
            .resolve(self.shared.config.default_ttl)
            .and_then(|ttl| now.checked_add(ttl));
        let estimated_size = estimate_size(&key, &value);

        let mut state = self.shared.lock();
        state.counters.sets += 1;
        let tick = state.tick();

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.value = value;
            entry.created_at = now;
            entry.accessed_at = now;
            entry.expires_at = expires_at;
            entry.estimated_size = estimated_size;
            entry.tick = tick;
            return;
        }

        if state.entries.len() >= self.shared.config.max_size {
            // An expired entry is a free slot; only evict live data when none is.
            let before = state.entries.len();
            state.entries.retain(|_, e| !e.is_expired(now));
            let expired = before - state.entries.len();
            state.counters.expirations += expired as u64;

            if state.entries.len() >= self.shared.config.max_size {
                let strategy = self.shared.config.strategy;
                if let Some(victim) = state.victim(strategy) {
                    if let Some(evicted) = state.entries.remove(&victim) {
                        state.counters.evictions += 1;
                        debug!(
                            key = %victim,
                            ?strategy,
                            idle_ms = now.saturating_duration_since(evicted.accessed_at).as_millis() as u64,
                            "cache entry evicted"
                        );
                    }
                }
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                accessed_at: now,
                expires_at,
                access_count: 0,
                estimated_size,
                seq,
                tick,
            },
        );
    }

    /// Insert with the default TTL.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.set(key, value, SetOptions::default());
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        if state.expire_if_due(key, now) {
            state.counters.misses += 1;
            return None;
        }
        let tick = state.tick();
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.accessed_at = now;
                entry.access_count += 1;
                entry.tick = tick;
                let value = entry.value.clone();
                state.counters.hits += 1;
                Some(value)
            }
            None => {
                state.counters.misses += 1;
                None
            }
        }
    }

    /// Whether a live entry exists. Does not count as an access.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.shared.lock();
        if state.expire_if_due(key, now) {
            state.counters.misses += 1;
            return false;
        }
        state.entries.contains_key(key)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.shared.lock().entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.shared.lock().entries.clear();
    }

    /// Change the expiry of a live entry. Returns `false` if there is none.
    pub fn set_ttl(&self, key: &str, ttl: Ttl) -> bool {
        let now = Instant::now();
        let default_ttl = self.shared.config.default_ttl;
        let mut state = self.shared.lock();
        if state.expire_if_due(key, now) {
            return false;
        }
        match state.entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = ttl.resolve(default_ttl).and_then(|d| now.checked_add(d));
                true
            }
            None => false,
        }
    }

    /// Remove every entry whose key matches. Returns the number removed.
    pub fn invalidate(&self, pattern: &Pattern) -> usize {
        let matcher = match pattern.matcher() {
            Ok(matcher) => matcher,
            Err(err) => {
                warn!(error = %err, "cache invalidation skipped");
                return 0;
            }
        };
        let mut state = self.shared.lock();
        let before = state.entries.len();
        state.entries.retain(|key, _| !matcher.is_match(key));
        let removed = before - state.entries.len();
        drop(state);

        debug!(removed, pattern = ?pattern, "cache invalidated");
        removed
    }

    /// Drop every expired entry now.
    pub fn purge_expired(&self) -> usize {
        self.shared.purge_expired()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let state = self.shared.lock();
        let c = &state.counters;
        let lookups = c.hits + c.misses;
        CacheStats {
            hits: c.hits,
            misses: c.misses,
            sets: c.sets,
            evictions: c.evictions,
            expirations: c.expirations,
            size: state.entries.len(),
            max_size: self.shared.config.max_size,
            total_bytes: state.entries.values().map(|e| e.estimated_size).sum(),
            oldest_age: state
                .entries
                .values()
                .map(|e| now.saturating_duration_since(e.created_at))
                .max(),
            newest_age: state
                .entries
                .values()
                .map(|e| now.saturating_duration_since(e.created_at))
                .min(),
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                c.hits as f64 / lookups as f64
            },
        }
    }

    /// Spawn a task that purges expired entries every `period`.
    ///
    /// The task holds only a weak reference and ends when the cache is
    /// dropped or the handle is shut down. Must be called inside a tokio
    /// runtime.
    pub fn start_sweeper(&self, period: Duration) -> SweeperHandle {
        sweeper::spawn(Arc::downgrade(&self.shared), period)
    }

    /// [`start_sweeper`](Self::start_sweeper) with the configured interval.
    pub fn start_default_sweeper(&self) -> SweeperHandle {
        self.start_sweeper(self.shared.config.sweep_interval)
    }

    /// Start the cache-owned sweeper at the configured interval unless one is
    /// already running. Returns `false` outside a tokio runtime.
    pub fn ensure_sweeper(&self) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no tokio runtime, cache sweeper not started");
            return false;
        };
        let mut sweeper = self
            .shared
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if sweeper.as_ref().is_none_or(|handle| handle.is_finished()) {
            *sweeper = Some(sweeper::spawn_on(
                &runtime,
                Arc::downgrade(&self.shared),
                self.shared.config.sweep_interval,
            ));
        }
        true
    }

    /// Whether the cache-owned sweeper is running.
    pub fn has_sweeper(&self) -> bool {
        self.shared
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

fn estimate_size<V: Serialize>(key: &str, value: &V) -> usize {
    key.len() + serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{Value, json};

    fn cache(max_size: usize, strategy: EvictionStrategy) -> CacheManager<Value> {
        CacheManager::new(
            CacheConfig::default()
                .with_max_size(max_size)
                .with_strategy(strategy),
        )
    }

    #[tokio::test]
    async fn entry_expires_after_ttl() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set("k", json!("v"), SetOptions::ttl(Duration::from_millis(100)));
        assert_eq!(cache.get("k"), Some(json!("v")));

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(cache.get("k"), None);
        assert!(!cache.has("k"));
        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn lru_evicts_least_recently_used() {
        let cache = cache(2, EvictionStrategy::Lru);
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));
        assert!(cache.get("a").is_some());
        cache.insert("c", json!(3));

        assert!(!cache.has("b"));
        assert!(cache.has("a"));
        assert!(cache.has("c"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn lfu_evicts_least_frequently_used() {
        let cache = cache(2, EvictionStrategy::Lfu);
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));
        cache.get("b");
        cache.get("b");
        cache.get("a");
        cache.insert("c", json!(3));

        assert!(!cache.has("a"));
        assert!(cache.has("b"));
    }

    #[test]
    fn ttl_strategy_evicts_nearest_expiry_and_keeps_immortal_entries() {
        let cache = cache(2, EvictionStrategy::Ttl);
        cache.set("forever", json!(1), SetOptions::ttl(Ttl::Never));
        cache.set("soon", json!(2), SetOptions::ttl(Duration::from_secs(10)));
        cache.set("later", json!(3), SetOptions::ttl(Duration::from_secs(20)));

        assert!(cache.has("forever"));
        assert!(!cache.has("soon"));
        assert!(cache.has("later"));
    }

    #[test]
    fn ties_go_to_earliest_insertion() {
        let cache = cache(2, EvictionStrategy::Lfu);
        cache.insert("first", json!(1));
        cache.insert("second", json!(2));
        cache.insert("third", json!(3));
        assert!(!cache.has("first"));
        assert!(cache.has("second"));
    }

    #[test]
    fn updating_existing_key_never_evicts() {
        let cache = cache(2, EvictionStrategy::Lru);
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));
        cache.insert("a", json!(10));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some(json!(10)));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn invalidate_by_exact_glob_and_regex() {
        let cache = cache(10, EvictionStrategy::Lru);
        for key in ["ocr:1", "ocr:2", "translate:1", "translate:2", "other"] {
            cache.insert(key, json!(key));
        }

        assert_eq!(cache.invalidate(&Pattern::exact("other")), 1);
        assert_eq!(cache.invalidate(&Pattern::glob("ocr:*")), 2);
        assert_eq!(cache.invalidate(&Pattern::regex("^translate:[12]$").unwrap()), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn set_ttl_requires_live_entry() {
        let cache = cache(10, EvictionStrategy::Lru);
        assert!(!cache.set_ttl("missing", Ttl::Never));
        cache.insert("k", json!(1));
        assert!(cache.set_ttl("k", Ttl::After(Duration::ZERO)));
    }

    #[test]
    fn delete_and_clear() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.insert("a", json!(1));
        cache.insert("b", json!(2));
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn stats_report_ratio_and_bytes() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.insert("a", json!("hello"));
        cache.get("a");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 0.5).abs() < f64::EPSILON);
        assert!(stats.total_bytes > 0);
        assert!(stats.oldest_age.is_some());

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["max_size"], 10);
    }

    #[tokio::test]
    async fn purge_expired_counts_removals() {
        let cache = cache(10, EvictionStrategy::Lru);
        cache.set("a", json!(1), SetOptions::ttl(Duration::from_millis(10)));
        cache.set("b", json!(2), SetOptions::ttl(Ttl::Never));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8),
        Get(u8),
        Delete(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..16).prop_map(Op::Set),
            (0u8..16).prop_map(Op::Get),
            (0u8..16).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

        #[test]
        fn size_never_exceeds_capacity(
            max_size in 1usize..6,
            strategy in prop_oneof![
                Just(EvictionStrategy::Lru),
                Just(EvictionStrategy::Lfu),
                Just(EvictionStrategy::Ttl),
            ],
            ops in proptest::collection::vec(op(), 0..64),
        ) {
            let cache = cache(max_size, strategy);
            for op in ops {
                match op {
                    Op::Set(k) => cache.insert(format!("k{k}"), json!(k)),
                    Op::Get(k) => { cache.get(&format!("k{k}")); }
                    Op::Delete(k) => { cache.delete(&format!("k{k}")); }
                }
                prop_assert!(cache.len() <= max_size);
            }
        }

        #[test]
        fn most_recent_set_is_always_present(keys in proptest::collection::vec(0u8..32, 1..64)) {
            let cache = cache(3, EvictionStrategy::Lru);
            for k in keys {
                let key = format!("k{k}");
                cache.insert(key.clone(), json!(k));
                prop_assert_eq!(cache.get(&key), Some(json!(k)));
            }
        }
    }
}
