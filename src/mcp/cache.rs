//! Tool Cache (C12, §4.12): keyed result cache for MCP tool calls with
//! pluggable eviction and a background cleanup loop.
//!
//! Grounded in the teacher's `cache.rs` `ResponseCache` (canonical-JSON
//! SHA-256 keying, atomic hit/miss/eviction counters, `evict_expired`
//! background sweep) generalized to a bounded `max_size` with a swappable
//! eviction policy and pattern-based invalidation (§4.12).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

/// Eviction policy applied when the cache is at capacity on `set` (§4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Evict the entry with the oldest `last_access`.
    Lru,
    /// Evict the entry with the smallest `access_count`.
    Lfu,
    /// Evict the entry with the oldest `created_at`.
    Fifo,
    /// Evict all currently-expired entries; if none are expired, fall back
    /// to LRU.
    Ttl,
}

struct CacheEntry {
    value: Value,
    created_at: Instant,
    last_access: RwLock<Instant>,
    access_count: AtomicU64,
    ttl: Duration,
    server: String,
    size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, max_age: Option<Duration>) -> bool {
        let cap = max_age.map_or(self.ttl, |age| age.min(self.ttl));
        self.created_at.elapsed() > cap
    }
}

/// Snapshot of cache statistics (§4.12 "Stats").
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits.
    pub hits: u64,
    /// Total cache misses.
    pub misses: u64,
    /// Hit rate, 0.0-1.0.
    pub hit_rate: f64,
    /// Total evictions (expired or capacity-driven).
    pub evictions: u64,
    /// Total `set` calls.
    pub sets: u64,
    /// Total `get` calls.
    pub gets: u64,
    /// Current number of entries.
    pub current_size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// `current_size / max_size`, 0.0-1.0.
    pub utilization: f64,
}

/// Result cache for tool calls, keyed by `tool_name + sha256(canonical(args))[:8]`.
pub struct ToolCache {
    entries: DashMap<String, CacheEntry>,
    policy: EvictionPolicy,
    max_size: usize,
    max_age: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    sets: AtomicU64,
    gets: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl ToolCache {
    /// Construct a cache bounded at `max_size` entries using `policy`, with
    /// an optional global `max_age` cap (I9: `now - created > min(entry.TTL,
    /// cache.max_age)`).
    #[must_use]
    pub fn new(policy: EvictionPolicy, max_size: usize, max_age: Option<Duration>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            entries: DashMap::new(),
            policy,
            max_size,
            max_age,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    /// Build the cache key for a tool call (§4.12).
    #[must_use]
    pub fn build_key(tool_name: &str, arguments: &Value) -> String {
        let canonical = serde_json::to_string(arguments).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        format!("{tool_name}{:08x}", u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
    }

    /// Fetch a cached value. Expired entries are deleted and counted as a
    /// miss; a hit updates `last_access`/`access_count` (§4.12 "On Get").
    pub fn get(&self, key: &str) -> Option<Value> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let Some(entry) = self.entries.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        if entry.is_expired(self.max_age) {
            drop(entry);
            self.entries.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        *entry.last_access.write() = Instant::now();
        entry.access_count.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value.clone())
    }

    /// Insert a value for `key`, evicting per policy if at capacity
    /// (§4.12 "On Set").
    pub fn set(&self, key: &str, value: Value, ttl: Duration, server: &str) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_size {
            self.make_room();
        }
        let size_bytes = serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: Instant::now(),
                last_access: RwLock::new(Instant::now()),
                access_count: AtomicU64::new(0),
                ttl,
                server: server.to_string(),
                size_bytes,
            },
        );
    }

    fn make_room(&self) {
        match self.policy {
            EvictionPolicy::Lru => self.evict_one_by(|e| *e.last_access.read()),
            EvictionPolicy::Lfu => self.evict_one_by(|e| e.access_count.load(Ordering::Relaxed)),
            EvictionPolicy::Fifo => self.evict_one_by(|e| e.created_at),
            EvictionPolicy::Ttl => {
                let expired: Vec<String> = self
                    .entries
                    .iter()
                    .filter(|e| e.value().is_expired(self.max_age))
                    .map(|e| e.key().clone())
                    .collect();
                if expired.is_empty() {
                    self.evict_one_by(|e| e.last_access.read().elapsed());
                } else {
                    for key in expired {
                        self.entries.remove(&key);
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Evict the single entry that minimizes `rank`: oldest `last_access`
    /// for LRU, smallest `access_count` for LFU, oldest `created_at` for
    /// FIFO.
    fn evict_one_by<K: Ord, F: Fn(&CacheEntry) -> K>(&self, rank: F) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|e| rank(e.value()))
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.entries.remove(&key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Remove every entry whose key contains `pattern`.
    pub fn invalidate(&self, pattern: &str) {
        let matches: Vec<String> = self.entries.iter().filter(|e| e.key().contains(pattern)).map(|e| e.key().clone()).collect();
        for key in matches {
            self.entries.remove(&key);
        }
    }

    /// Remove every entry populated by `server`.
    pub fn invalidate_by_server(&self, server: &str) {
        let matches: Vec<String> = self.entries.iter().filter(|e| e.value().server == server).map(|e| e.key().clone()).collect();
        for key in matches {
            self.entries.remove(&key);
        }
    }

    /// Remove all currently-expired entries (§4.12 "Background cleanup").
    pub fn cleanup_expired(&self) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(self.max_age))
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.entries.remove(&key);
        }
        if count > 0 {
            self.evictions.fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    /// Current statistics snapshot.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let current_size = self.entries.len();
        CacheStatsSnapshot {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            evictions: self.evictions.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            current_size,
            max_size: self.max_size,
            utilization: if self.max_size == 0 { 0.0 } else { current_size as f64 / self.max_size as f64 },
        }
    }

    /// Start the once-a-minute background cleanup loop.
    pub fn start(self: &std::sync::Arc<Self>, interval: Duration) {
        let this = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut shutdown_rx = this.shutdown_tx.subscribe();
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.cleanup_expired(),
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Stop the background cleanup loop. Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Default cleanup cadence (§4.12 "every minute").
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_immediate_get_returns_the_value() {
        let cache = ToolCache::new(EvictionPolicy::Lru, 10, None);
        cache.set("k", json!({"a": 1}), Duration::from_secs(60), "s1");
        assert_eq!(cache.get("k"), Some(json!({"a": 1})));
    }

    #[test]
    fn set_with_ttl_then_get_after_expiry_is_a_miss() {
        let cache = ToolCache::new(EvictionPolicy::Lru, 10, None);
        cache.set("k", json!(1), Duration::from_millis(1), "s1");
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn inserting_beyond_max_size_caps_at_max_size() {
        let cache = ToolCache::new(EvictionPolicy::Lru, 3, None);
        for i in 0..5 {
            cache.set(&format!("k{i}"), json!(i), Duration::from_secs(60), "s1");
        }
        assert_eq!(cache.stats().current_size, 3);
    }

    #[test]
    fn lru_evicts_the_least_recently_accessed() {
        let cache = ToolCache::new(EvictionPolicy::Lru, 2, None);
        cache.set("a", json!(1), Duration::from_secs(60), "s1");
        std::thread::sleep(Duration::from_millis(5));
        cache.set("b", json!(2), Duration::from_secs(60), "s1");
        cache.get("a"); // touch a, making b the LRU victim
        std::thread::sleep(Duration::from_millis(5));
        cache.set("c", json!(3), Duration::from_secs(60), "s1");
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn lfu_evicts_the_least_frequently_used() {
        let cache = ToolCache::new(EvictionPolicy::Lfu, 2, None);
        cache.set("a", json!(1), Duration::from_secs(60), "s1");
        cache.set("b", json!(2), Duration::from_secs(60), "s1");
        cache.get("a");
        cache.get("a");
        cache.set("c", json!(3), Duration::from_secs(60), "s1");
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn build_key_is_stable_across_semantically_equal_argument_orderings() {
        let k1 = ToolCache::build_key("tool", &json!({"a": 1, "b": 2}));
        let k2 = ToolCache::build_key("tool", &json!({"b": 2, "a": 1}));
        assert_eq!(k1, k2);
    }

    #[test]
    fn invalidate_by_server_clears_only_that_servers_entries() {
        let cache = ToolCache::new(EvictionPolicy::Lru, 10, None);
        cache.set("a", json!(1), Duration::from_secs(60), "s1");
        cache.set("b", json!(2), Duration::from_secs(60), "s2");
        cache.invalidate_by_server("s1");
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
    }

    #[test]
    fn tool_cache_hit_scenario_matches_spec_example() {
        let cache = ToolCache::new(EvictionPolicy::Lru, 10, None);
        let key = ToolCache::build_key("echo", &json!({"x": 1}));
        assert!(cache.get(&key).is_none()); // miss, driver invoked by caller
        cache.set(&key, json!({"x": 1}), Duration::from_secs(5), "s1");
        assert!(cache.get(&key).is_some()); // hit, driver not invoked
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }
}
