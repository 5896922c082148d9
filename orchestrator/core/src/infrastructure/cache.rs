// Copyright (c) 2026 Fleetmux Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Generic TTL+LRU cache (C1) and the four specialized caches composed from
//! it: tools, response, child-status, profile.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use crate::domain::errors::CacheError;

struct Entry<V> {
    value: V,
    ttl: Duration,
    inserted_at: Instant,
    last_accessed: Instant,
    access_count: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub hit_rate: f64,
}

/// A generic mapping from string key to opaque value with per-entry expiry
/// and bounded capacity. Eviction on `set` at capacity removes the entry
/// with the oldest `last_accessed`. Infallible at runtime; only construction
/// can fail with [`CacheError::CapacityZero`].
pub struct TtlLruCache<V> {
    inner: RwLock<Inner<V>>,
    capacity: usize,
}

struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<V: Clone> TtlLruCache<V> {
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        if capacity == 0 {
            return Err(CacheError::CapacityZero);
        }
        Ok(Self {
            inner: RwLock::new(Inner {
                entries: HashMap::with_capacity(capacity),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            capacity,
        })
    }

    /// Returns `(value, hit)`. A hit updates `last_accessed`/`access_count`;
    /// an expired entry is treated as a miss and is not evicted here (the
    /// background sweeper reclaims it).
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.write();
        let hit = match inner.entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.last_accessed = Instant::now();
                entry.access_count += 1;
                Some(entry.value.clone())
            }
            _ => None,
        };
        if hit.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        hit
    }

    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let mut inner = self.inner.write();
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            if let Some(oldest_key) = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed)
                .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest_key);
                inner.evictions += 1;
            }
        }
        let now = Instant::now();
        inner.entries.insert(
            key,
            Entry {
                value,
                ttl,
                inserted_at: now,
                last_accessed: now,
                access_count: 0,
            },
        );
    }

    pub fn delete(&self, key: &str) {
        self.inner.write().entries.remove(key);
    }

    pub fn clear(&self) {
        self.inner.write().entries.clear();
    }

    /// Removes all expired entries. Called by the background sweeper.
    pub fn sweep_expired(&self) {
        let mut inner = self.inner.write();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            inner.entries.remove(&key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        let total = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size: inner.entries.len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                inner.hits as f64 / total as f64
            },
        }
    }
}

/// Runs [`TtlLruCache::sweep_expired`] on `cache` at `interval` until the
/// token is cancelled.
pub async fn run_sweeper<V: Clone + Send + Sync + 'static>(
    cache: std::sync::Arc<TtlLruCache<V>>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => cache.sweep_expired(),
        }
    }
}

pub const TOOLS_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
pub const TOOLS_CACHE_CAPACITY: usize = 1000;
pub const RESPONSE_CACHE_TTL: Duration = Duration::from_secs(30);
pub const RESPONSE_CACHE_CAPACITY: usize = 500;
pub const CHILD_STATUS_CACHE_TTL: Duration = Duration::from_secs(60);
pub const CHILD_STATUS_CACHE_CAPACITY: usize = 256;
pub const PROFILE_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
pub const PROFILE_CACHE_CAPACITY: usize = 64;

/// Response-cache key: `sha(toolName|childId|canonicalizedArgs)`.
///
/// Deliberately omits the active profile id (see DESIGN.md Open Question 2);
/// `args` is re-serialized through `serde_json::Value` first so that two
/// requests with the same keys in different orders hash identically.
pub fn response_cache_key(tool_name: &str, child_id: &str, args: &serde_json::Value) -> String {
    use sha2::{Digest, Sha256};
    let canonical = canonicalize_json(args);
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update(b"|");
    hasher.update(child_id.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serializes a JSON value with object keys sorted, so semantically
/// identical argument maps hash to the same cache key regardless of the
/// order the caller supplied them in.
fn canonicalize_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = String::from("{");
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&format!("{:?}:{}", k, canonicalize_json(&map[*k])));
            }
            out.push('}');
            out
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonicalize_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn capacity_zero_rejected_at_construction() {
        let result: Result<TtlLruCache<i32>, _> = TtlLruCache::new(0);
        assert!(matches!(result, Err(CacheError::CapacityZero)));
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache: TtlLruCache<i32> = TtlLruCache::new(4).unwrap();
        cache.set("k", 1, Duration::from_millis(5));
        sleep(Duration::from_millis(20));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn evicts_oldest_last_accessed_when_full() {
        let cache: TtlLruCache<i32> = TtlLruCache::new(2).unwrap();
        cache.set("a", 1, Duration::from_secs(60));
        cache.set("b", 2, Duration::from_secs(60));
        // touch "a" so "b" becomes the oldest by last_accessed
        cache.get("a");
        cache.set("c", 3, Duration::from_secs(60));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn stats_track_hits_misses_and_hit_rate() {
        let cache: TtlLruCache<i32> = TtlLruCache::new(4).unwrap();
        cache.set("k", 1, Duration::from_secs(60));
        cache.get("k");
        cache.get("missing");
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[test]
    fn response_cache_key_is_order_independent() {
        let a = serde_json::json!({"q": "x", "limit": 5});
        let b = serde_json::json!({"limit": 5, "q": "x"});
        assert_eq!(
            response_cache_key("search", "github", &a),
            response_cache_key("search", "github", &b)
        );
    }
}
