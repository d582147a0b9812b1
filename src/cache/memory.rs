use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::index::CacheIndex;
use crate::cache::{Cache, CacheObserver};
use crate::config::CachingConfig;
use crate::error::Error;
use crate::metrics::ProxyMetrics;

/// In-process byte store. Eviction and TTL are driven entirely by the
/// cache index reaper; the map itself holds bytes only.
pub struct MemoryCache {
    name: String,
    config: CachingConfig,
    store: Arc<DashMap<String, Bytes>>,
    index: Arc<CacheIndex>,
    observer: CacheObserver,
    shutdown: CancellationToken,
}

impl MemoryCache {
    pub fn new(
        name: &str,
        config: CachingConfig,
        metrics: Arc<ProxyMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let observer = CacheObserver::new(name, &config.cache_type, metrics);
        let index = Arc::new(CacheIndex::new(config.index.clone(), observer.clone()));
        Self {
            name: name.to_string(),
            config,
            store: Arc::new(DashMap::new()),
            index,
            observer,
            shutdown,
        }
    }

    /// Test hook: runs one synchronous reap pass against the byte store.
    pub fn reap_now(&self) {
        let removals = self.index.reap_once();
        for key in removals {
            self.store.remove(&key);
        }
    }

    pub fn index(&self) -> &Arc<CacheIndex> {
        &self.index
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn connect(&self) -> Result<(), Error> {
        let store = Arc::clone(&self.store);
        self.index.start_reaper(
            Arc::new(move |keys: Vec<String>| {
                for key in keys {
                    store.remove(&key);
                }
            }),
            self.shutdown.clone(),
        );
        Ok(())
    }

    async fn store(&self, key: &str, data: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        let len = data.len();
        debug!(cache = %self.name, key, bytes = len, "memory cache store");
        self.observer.operation("set", "none", len);
        self.store.insert(key.to_string(), Bytes::from(data));
        self.index.update_object(key, len as u64, ttl);
        self.observer
            .size_change(self.index.byte_count(), self.index.object_count());
        Ok(())
    }

    async fn retrieve(&self, key: &str, allow_expired: bool) -> Result<Vec<u8>, Error> {
        if !allow_expired && self.index.is_expired(key) {
            self.remove(key).await;
            return Err(self.observer.miss(key));
        }
        match self.store.get(key) {
            Some(data) => {
                debug!(cache = %self.name, key, "memory cache retrieve");
                self.observer.operation("get", "hit", data.len());
                self.index.update_object_access_time(key);
                Ok(data.to_vec())
            }
            None => Err(self.observer.miss(key)),
        }
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) {
        self.index.set_expiration(key, ttl);
    }

    async fn remove(&self, key: &str) {
        debug!(cache = %self.name, key, "memory cache remove");
        self.store.remove(key);
        self.index.remove_object(key);
        self.observer.operation("del", "none", 0);
    }

    async fn bulk_remove(&self, keys: &[String]) {
        for key in keys {
            self.store.remove(key);
            self.index.remove_object(key);
        }
    }

    async fn close(&self) -> Result<(), Error> {
        self.store.clear();
        Ok(())
    }

    fn configuration(&self) -> &CachingConfig {
        &self.config
    }

    fn name(&self) -> &str {
        &self.name
    }
}
