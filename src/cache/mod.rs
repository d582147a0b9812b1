use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{CachingConfig, TricksterConfig};
use crate::error::Error;
use crate::metrics::ProxyMetrics;

pub mod filesystem;
pub mod index;
pub mod locker;
pub mod memory;
pub mod redis;
pub mod rocks;

/// The possible outcomes of a cache lookup, as reported in the
/// `X-Trickster-Result` header and the `cache_status` metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    /// Full cache hit.
    Hit,
    /// Key exists with some, but not all, of the requested range.
    PartialHit,
    /// Key exists but holds no data for the requested range.
    RangeMiss,
    /// Cache key does not exist.
    KeyMiss,
    /// The key, if it existed, was purged as directed by request or
    /// response headers.
    Purge,
    /// A proxy error occurred retrieving a cacheable dataset.
    ProxyError,
    /// The request was fully proxied to the origin without the cache.
    ProxyOnly,
}

impl fmt::Display for LookupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LookupStatus::Hit => "hit",
            LookupStatus::PartialHit => "phit",
            LookupStatus::RangeMiss => "rmiss",
            LookupStatus::KeyMiss => "kmiss",
            LookupStatus::Purge => "purge",
            LookupStatus::ProxyError => "proxy-error",
            LookupStatus::ProxyOnly => "proxy-only",
        };
        write!(f, "{}", s)
    }
}

/// The contract every caching fabric implements. `retrieve` must return
/// `Error::CacheMiss` on a miss; engines degrade any other read error to a
/// key miss and continue via the origin.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn connect(&self) -> Result<(), Error>;
    async fn store(&self, key: &str, data: Vec<u8>, ttl: Duration) -> Result<(), Error>;
    async fn retrieve(&self, key: &str, allow_expired: bool) -> Result<Vec<u8>, Error>;
    async fn set_ttl(&self, key: &str, ttl: Duration);
    async fn remove(&self, key: &str);
    async fn bulk_remove(&self, keys: &[String]);
    async fn close(&self) -> Result<(), Error>;
    fn configuration(&self) -> &CachingConfig;
    fn name(&self) -> &str;
}

/// Shared instrumentation handle carried by every backend: one place to
/// observe operations, events, and size changes against the registry.
#[derive(Clone)]
pub struct CacheObserver {
    pub cache_name: String,
    pub cache_type: String,
    metrics: Arc<ProxyMetrics>,
}

impl CacheObserver {
    pub fn new(cache_name: &str, cache_type: &str, metrics: Arc<ProxyMetrics>) -> Self {
        Self {
            cache_name: cache_name.to_string(),
            cache_type: cache_type.to_string(),
            metrics,
        }
    }

    /// Increments counters as cache operations occur.
    pub fn operation(&self, operation: &str, status: &str, bytes: usize) {
        self.metrics
            .cache_object_operations_total
            .with_label_values(&[&self.cache_name, &self.cache_type, operation, status])
            .inc();
        if bytes > 0 {
            self.metrics
                .cache_byte_operations_total
                .with_label_values(&[&self.cache_name, &self.cache_type, operation, status])
                .inc_by(bytes as u64);
        }
    }

    /// Increments counters as cache lifecycle events occur.
    pub fn event(&self, event: &str, reason: &str) {
        self.metrics
            .cache_events_total
            .with_label_values(&[&self.cache_name, &self.cache_type, event, reason])
            .inc();
    }

    /// Updates the size gauges after object operations or a reap.
    pub fn size_change(&self, byte_count: u64, object_count: u64) {
        self.metrics
            .cache_objects
            .with_label_values(&[&self.cache_name, &self.cache_type])
            .set(object_count as f64);
        self.metrics
            .cache_bytes
            .with_label_values(&[&self.cache_name, &self.cache_type])
            .set(byte_count as f64);
    }

    /// Records the standard miss observation and produces the miss error.
    pub fn miss(&self, key: &str) -> Error {
        self.operation("get", "miss", 0);
        Error::CacheMiss(key.to_string())
    }
}

/// Builds and connects every cache named in the configuration.
pub async fn load_caches_from_config(
    cfg: &TricksterConfig,
    metrics: Arc<ProxyMetrics>,
    shutdown: CancellationToken,
) -> Result<HashMap<String, Arc<dyn Cache>>, Error> {
    let mut caches: HashMap<String, Arc<dyn Cache>> = HashMap::new();
    for (name, cc) in &cfg.caches {
        let cache: Arc<dyn Cache> = match cc.cache_type.as_str() {
            "memory" => Arc::new(memory::MemoryCache::new(
                name,
                cc.clone(),
                metrics.clone(),
                shutdown.clone(),
            )),
            "filesystem" => Arc::new(filesystem::FilesystemCache::new(
                name,
                cc.clone(),
                metrics.clone(),
                shutdown.clone(),
            )),
            "rocksdb" => Arc::new(rocks::RocksCache::new(name, cc.clone(), metrics.clone())),
            "redis" => Arc::new(redis::RedisCache::new(name, cc.clone(), metrics.clone())),
            other => {
                return Err(Error::Config(format!(
                    "cache {}: unknown cache_type {}",
                    name, other
                )));
            }
        };
        cache.connect().await?;
        info!(cache = %name, cache_type = %cc.cache_type, "cache connected");
        caches.insert(name.clone(), cache);
    }
    Ok(caches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_status_strings() {
        assert_eq!(LookupStatus::Hit.to_string(), "hit");
        assert_eq!(LookupStatus::PartialHit.to_string(), "phit");
        assert_eq!(LookupStatus::RangeMiss.to_string(), "rmiss");
        assert_eq!(LookupStatus::KeyMiss.to_string(), "kmiss");
        assert_eq!(LookupStatus::Purge.to_string(), "purge");
        assert_eq!(LookupStatus::ProxyError.to_string(), "proxy-error");
        assert_eq!(LookupStatus::ProxyOnly.to_string(), "proxy-only");
    }
}
