use async_trait::async_trait;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::debug;

use crate::cache::index::now_ns;
use crate::cache::{Cache, CacheObserver};
use crate::config::CachingConfig;
use crate::error::Error;
use crate::metrics::ProxyMetrics;

/// Disk key/value store backed by RocksDB. Self-managing: per-key
/// expiration rides in an 8-byte value prefix checked on read, and the
/// DB-level TTL compaction sweeps dead bytes, so the cache index is not
/// consulted for eviction.
pub struct RocksCache {
    name: String,
    config: CachingConfig,
    db: OnceLock<rocksdb::DB>,
    observer: CacheObserver,
}

impl RocksCache {
    pub fn new(name: &str, config: CachingConfig, metrics: Arc<ProxyMetrics>) -> Self {
        let observer = CacheObserver::new(name, &config.cache_type, metrics);
        Self {
            name: name.to_string(),
            config,
            db: OnceLock::new(),
            observer,
        }
    }

    fn db(&self) -> Result<&rocksdb::DB, Error> {
        self.db
            .get()
            .ok_or_else(|| Error::CacheRead("rocksdb not connected".to_string()))
    }

    fn envelope(expiration: i64, data: &[u8]) -> Vec<u8> {
        let mut v = Vec::with_capacity(8 + data.len());
        v.extend_from_slice(&expiration.to_be_bytes());
        v.extend_from_slice(data);
        v
    }

    fn open(value: &[u8]) -> Option<(i64, &[u8])> {
        if value.len() < 8 {
            return None;
        }
        let mut exp_bytes = [0u8; 8];
        exp_bytes.copy_from_slice(&value[..8]);
        Some((i64::from_be_bytes(exp_bytes), &value[8..]))
    }
}

#[async_trait]
impl Cache for RocksCache {
    async fn connect(&self) -> Result<(), Error> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        // one-day compaction TTL as a backstop behind the per-key check
        let db = rocksdb::DB::open_with_ttl(
            &opts,
            &self.config.rocksdb.path,
            Duration::from_secs(86_400),
        )
        .map_err(|e| Error::Config(format!("rocksdb open: {}", e)))?;
        self.db
            .set(db)
            .map_err(|_| Error::Config("rocksdb already connected".to_string()))?;
        Ok(())
    }

    async fn store(&self, key: &str, data: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        let expiration = if ttl.is_zero() {
            0
        } else {
            now_ns() + ttl.as_nanos() as i64
        };
        let len = data.len();
        debug!(cache = %self.name, key, bytes = len, "rocksdb cache store");
        self.db()?
            .put(key.as_bytes(), Self::envelope(expiration, &data))
            .map_err(|e| Error::CacheWrite(e.to_string()))?;
        self.observer.operation("set", "none", len);
        Ok(())
    }

    async fn retrieve(&self, key: &str, allow_expired: bool) -> Result<Vec<u8>, Error> {
        let value = self
            .db()?
            .get(key.as_bytes())
            .map_err(|e| Error::CacheRead(e.to_string()))?;
        match value.as_deref().and_then(Self::open) {
            Some((expiration, data)) => {
                if !allow_expired && expiration > 0 && expiration <= now_ns() {
                    self.remove(key).await;
                    return Err(self.observer.miss(key));
                }
                debug!(cache = %self.name, key, "rocksdb cache retrieve");
                self.observer.operation("get", "hit", data.len());
                Ok(data.to_vec())
            }
            None => Err(self.observer.miss(key)),
        }
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) {
        // rewrite the expiration prefix in place
        if let Ok(db) = self.db() {
            if let Ok(Some(value)) = db.get(key.as_bytes()) {
                if let Some((_, data)) = Self::open(&value) {
                    let expiration = if ttl.is_zero() {
                        0
                    } else {
                        now_ns() + ttl.as_nanos() as i64
                    };
                    let _ = db.put(key.as_bytes(), Self::envelope(expiration, data));
                }
            }
        }
    }

    async fn remove(&self, key: &str) {
        debug!(cache = %self.name, key, "rocksdb cache remove");
        if let Ok(db) = self.db() {
            let _ = db.delete(key.as_bytes());
        }
        self.observer.operation("del", "none", 0);
    }

    async fn bulk_remove(&self, keys: &[String]) {
        if let Ok(db) = self.db() {
            for key in keys {
                let _ = db.delete(key.as_bytes());
            }
        }
    }

    async fn close(&self) -> Result<(), Error> {
        // the DB handle flushes and closes on drop at process exit
        Ok(())
    }

    fn configuration(&self) -> &CachingConfig {
        &self.config
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static TEST_SEQ: AtomicUsize = AtomicUsize::new(0);

    fn new_cache() -> RocksCache {
        let seq = TEST_SEQ.fetch_add(1, Ordering::SeqCst);
        let config = CachingConfig {
            cache_type: "rocksdb".to_string(),
            rocksdb: crate::config::RocksDBCacheConfig {
                path: std::env::temp_dir()
                    .join(format!("trickster-rocks-test-{}-{}", std::process::id(), seq))
                    .to_string_lossy()
                    .to_string(),
            },
            ..Default::default()
        };
        RocksCache::new("test", config, Arc::new(ProxyMetrics::new()))
    }

    #[tokio::test]
    async fn test_store_retrieve_remove() {
        let rc = new_cache();
        rc.connect().await.unwrap();
        rc.store("k", b"data".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(rc.retrieve("k", false).await.unwrap(), b"data");
        rc.remove("k").await;
        assert!(rc.retrieve("k", false).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_value_is_a_miss() {
        let rc = new_cache();
        rc.connect().await.unwrap();
        rc.store("k", b"data".to_vec(), Duration::from_nanos(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(rc.retrieve("k", false).await.is_err());
    }

    #[test]
    fn test_envelope_round_trip() {
        let v = RocksCache::envelope(12345, b"payload");
        let (exp, data) = RocksCache::open(&v).unwrap();
        assert_eq!(exp, 12345);
        assert_eq!(data, b"payload");
        assert!(RocksCache::open(&v[..4]).is_none());
    }
}
