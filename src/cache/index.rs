use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::CacheObserver;
use crate::config::CacheIndexConfig;

/// Returns the current time as nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Metadata the index tracks for each stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub key: String,
    pub size: u64,
    /// Epoch ns; 0 means no expiration.
    pub expiration: i64,
    pub last_access: i64,
    pub last_write: i64,
    pub hit_count: u64,
}

/// Process-wide object metadata for backends without their own eviction:
/// drives TTL reaping and LRU eviction against the byte store.
///
/// A single RwLock guards the map. The reaper computes its removal batch
/// under the write side, then releases the lock before the backend deletes
/// bytes, so backend I/O never runs under the index lock.
pub struct CacheIndex {
    entries: RwLock<HashMap<String, IndexEntry>>,
    config: CacheIndexConfig,
    observer: CacheObserver,
}

impl CacheIndex {
    pub fn new(config: CacheIndexConfig, observer: CacheObserver) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            observer,
        }
    }

    /// Restores a previously flushed index (disk-backed caches).
    pub fn load(&self, data: &[u8]) {
        if let Ok(map) = serde_json::from_slice::<HashMap<String, IndexEntry>>(data) {
            let mut entries = self.entries.write().unwrap();
            *entries = map;
        }
    }

    /// Serializes the index for a disk flush.
    pub fn to_bytes(&self) -> Vec<u8> {
        let entries = self.entries.read().unwrap();
        serde_json::to_vec(&*entries).unwrap_or_default()
    }

    /// Records a store, creating or refreshing the entry.
    pub fn update_object(&self, key: &str, size: u64, ttl: std::time::Duration) {
        let now = now_ns();
        let expiration = if ttl.is_zero() {
            0
        } else {
            now + ttl.as_nanos() as i64
        };
        let mut entries = self.entries.write().unwrap();
        let e = entries.entry(key.to_string()).or_insert_with(|| IndexEntry {
            key: key.to_string(),
            size: 0,
            expiration: 0,
            last_access: now,
            last_write: now,
            hit_count: 0,
        });
        e.size = size;
        e.expiration = expiration;
        e.last_write = now;
        e.last_access = now;
    }

    /// Touches the entry for LRU ordering and bumps its hit count.
    pub fn update_object_access_time(&self, key: &str) {
        let now = now_ns();
        let mut entries = self.entries.write().unwrap();
        if let Some(e) = entries.get_mut(key) {
            e.last_access = now;
            e.hit_count += 1;
        }
    }

    pub fn remove_object(&self, key: &str) {
        let mut entries = self.entries.write().unwrap();
        entries.remove(key);
    }

    /// Epoch-ns expiration for `key`; None when unknown, Some(0) when the
    /// entry never expires.
    pub fn get_expiration(&self, key: &str) -> Option<i64> {
        let entries = self.entries.read().unwrap();
        entries.get(key).map(|e| e.expiration)
    }

    pub fn set_expiration(&self, key: &str, ttl: std::time::Duration) {
        let mut entries = self.entries.write().unwrap();
        if let Some(e) = entries.get_mut(key) {
            e.expiration = if ttl.is_zero() {
                0
            } else {
                now_ns() + ttl.as_nanos() as i64
            };
        }
    }

    /// True when the entry exists and its expiration has passed.
    pub fn is_expired(&self, key: &str) -> bool {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(e) => e.expiration > 0 && e.expiration <= now_ns(),
            None => false,
        }
    }

    pub fn object_count(&self) -> u64 {
        self.entries.read().unwrap().len() as u64
    }

    pub fn byte_count(&self) -> u64 {
        self.entries.read().unwrap().values().map(|e| e.size).sum()
    }

    /// One reap pass: drops expired entries, then evicts least-recently
    /// accessed entries while either high-water mark is exceeded, down to
    /// `max - backoff`. Returns the keys whose bytes the caller must
    /// delete from the backend; the index lock is already released by the
    /// time this returns.
    pub fn reap_once(&self) -> Vec<String> {
        let now = now_ns();
        let mut removals: Vec<String> = Vec::new();

        let (byte_count, object_count) = {
            let mut entries = self.entries.write().unwrap();

            let expired: Vec<String> = entries
                .values()
                .filter(|e| e.expiration > 0 && e.expiration <= now)
                .map(|e| e.key.clone())
                .collect();
            for key in &expired {
                entries.remove(key);
                self.observer.event("expire", "ttl");
            }
            removals.extend(expired);

            let mut bytes: u64 = entries.values().map(|e| e.size).sum();
            let mut objects = entries.len() as u64;
            let over_bytes =
                self.config.max_size_bytes > 0 && bytes > self.config.max_size_bytes;
            let over_objects =
                self.config.max_size_objects > 0 && objects > self.config.max_size_objects;

            if over_bytes || over_objects {
                let byte_floor = self
                    .config
                    .max_size_bytes
                    .saturating_sub(self.config.max_size_backoff_bytes);
                let object_floor = self
                    .config
                    .max_size_objects
                    .saturating_sub(self.config.max_size_backoff_objects);

                let mut lru: Vec<(i64, String, u64)> = entries
                    .values()
                    .map(|e| (e.last_access, e.key.clone(), e.size))
                    .collect();
                lru.sort();

                let mut evicted = 0usize;
                for (_, key, size) in lru {
                    let need_bytes = self.config.max_size_bytes > 0 && bytes > byte_floor;
                    let need_objects =
                        self.config.max_size_objects > 0 && objects > object_floor;
                    if !need_bytes && !need_objects {
                        break;
                    }
                    entries.remove(&key);
                    self.observer.event("evict", "lru");
                    bytes = bytes.saturating_sub(size);
                    objects -= 1;
                    evicted += 1;
                    removals.push(key);
                }
                warn!(
                    cache = %self.observer.cache_name,
                    evicted,
                    "cache over high-water mark, evicted LRU entries"
                );
            }

            (bytes, objects)
        };

        self.observer.size_change(byte_count, object_count);
        removals
    }

    /// Runs the reaper on its own timer until shutdown. `remover` deletes
    /// the evicted keys from the backing byte store.
    pub fn start_reaper(
        self: &Arc<Self>,
        remover: Arc<dyn Fn(Vec<String>) + Send + Sync>,
        shutdown: CancellationToken,
    ) {
        let index = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(index.config.reap_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removals = index.reap_once();
                        if !removals.is_empty() {
                            debug!(count = removals.len(), "reaper removed cache entries");
                            remover(removals);
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("cache index reaper stopping");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ProxyMetrics;

    fn new_index(cfg: CacheIndexConfig) -> CacheIndex {
        let observer =
            CacheObserver::new("test", "memory", Arc::new(ProxyMetrics::new()));
        CacheIndex::new(cfg, observer)
    }

    #[test]
    fn test_update_and_expiration() {
        let idx = new_index(CacheIndexConfig::default());
        assert_eq!(idx.get_expiration("k"), None);
        idx.update_object("k", 10, std::time::Duration::from_secs(60));
        let exp = idx.get_expiration("k").unwrap();
        assert!(exp > now_ns());
        idx.set_expiration("k", std::time::Duration::from_secs(3600));
        assert!(idx.get_expiration("k").unwrap() > exp);
    }

    #[test]
    fn test_reap_removes_expired() {
        let idx = new_index(CacheIndexConfig::default());
        idx.update_object("stale", 10, std::time::Duration::from_nanos(1));
        idx.update_object("fresh", 10, std::time::Duration::from_secs(60));
        std::thread::sleep(std::time::Duration::from_millis(2));
        let removed = idx.reap_once();
        assert_eq!(removed, vec!["stale".to_string()]);
        assert_eq!(idx.object_count(), 1);
    }

    #[test]
    fn test_reap_evicts_lru_to_low_water() {
        let cfg = CacheIndexConfig {
            max_size_bytes: 100,
            max_size_backoff_bytes: 40,
            ..Default::default()
        };
        let idx = new_index(cfg);
        for i in 0..6 {
            idx.update_object(&format!("k{}", i), 20, std::time::Duration::from_secs(60));
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        // 120 bytes stored; eviction floor is 100-40=60
        let removed = idx.reap_once();
        assert!(removed.contains(&"k0".to_string()));
        assert!(idx.byte_count() <= 60);
        assert!(!removed.contains(&"k5".to_string()));
    }

    #[test]
    fn test_access_time_protects_from_eviction() {
        let cfg = CacheIndexConfig {
            max_size_objects: 2,
            max_size_backoff_objects: 1,
            max_size_bytes: 0,
            ..Default::default()
        };
        let idx = new_index(cfg);
        idx.update_object("a", 1, std::time::Duration::from_secs(60));
        std::thread::sleep(std::time::Duration::from_millis(1));
        idx.update_object("b", 1, std::time::Duration::from_secs(60));
        std::thread::sleep(std::time::Duration::from_millis(1));
        idx.update_object("c", 1, std::time::Duration::from_secs(60));
        std::thread::sleep(std::time::Duration::from_millis(1));
        idx.update_object_access_time("a");
        let removed = idx.reap_once();
        assert!(!removed.contains(&"a".to_string()));
        assert!(idx.object_count() <= 1);
    }

    #[test]
    fn test_index_round_trip() {
        let idx = new_index(CacheIndexConfig::default());
        idx.update_object("k", 42, std::time::Duration::from_secs(60));
        let bytes = idx.to_bytes();
        let idx2 = new_index(CacheIndexConfig::default());
        idx2.load(&bytes);
        assert_eq!(idx2.object_count(), 1);
        assert_eq!(idx2.byte_count(), 42);
    }
}
