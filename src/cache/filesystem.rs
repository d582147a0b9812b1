use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::cache::index::CacheIndex;
use crate::cache::{Cache, CacheObserver};
use crate::config::CachingConfig;
use crate::error::Error;
use crate::metrics::ProxyMetrics;

const INDEX_FILENAME: &str = "cache.index.json";

/// Cache keys are hex digests; anything else is defanged before it
/// becomes a filename.
fn safe_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Disk-backed byte store: one file per key under
/// `cache_path/<cache-name>/`, written with a tempfile-and-rename so a
/// crashed write never leaves a torn object. The cache index drives TTL
/// and LRU eviction and is flushed to disk on its own cadence so entries
/// survive a restart.
pub struct FilesystemCache {
    name: String,
    config: CachingConfig,
    root: PathBuf,
    index: Arc<CacheIndex>,
    observer: CacheObserver,
    shutdown: CancellationToken,
}

impl FilesystemCache {
    pub fn new(
        name: &str,
        config: CachingConfig,
        metrics: Arc<ProxyMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        let observer = CacheObserver::new(name, &config.cache_type, metrics);
        let index = Arc::new(CacheIndex::new(config.index.clone(), observer.clone()));
        let root = Path::new(&config.filesystem.cache_path).join(name);
        Self {
            name: name.to_string(),
            config,
            root,
            index,
            observer,
            shutdown,
        }
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.data", safe_key(key)))
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), Error> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| Error::CacheWrite(e.to_string()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| Error::CacheWrite(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Cache for FilesystemCache {
    async fn connect(&self) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::Config(format!("cache path {:?}: {}", self.root, e)))?;

        // restore the index from the previous run, if one was flushed
        let index_path = self.root.join(INDEX_FILENAME);
        if let Ok(data) = tokio::fs::read(&index_path).await {
            self.index.load(&data);
            debug!(cache = %self.name, objects = self.index.object_count(), "restored cache index");
        }

        let root = self.root.clone();
        self.index.start_reaper(
            Arc::new(move |keys: Vec<String>| {
                for key in keys {
                    let path = root.join(format!("{}.data", safe_key(&key)));
                    let _ = std::fs::remove_file(path);
                }
            }),
            self.shutdown.clone(),
        );

        // periodic index flush, independent of the reap cadence
        let index = Arc::clone(&self.index);
        let index_path = self.root.join(INDEX_FILENAME);
        let shutdown = self.shutdown.clone();
        let flush_interval = self.config.index.flush_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let tmp = index_path.with_extension("tmp");
                        let data = index.to_bytes();
                        if tokio::fs::write(&tmp, &data).await.is_ok() {
                            if let Err(e) = tokio::fs::rename(&tmp, &index_path).await {
                                error!("cache index flush failed: {}", e);
                            }
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });

        Ok(())
    }

    async fn store(&self, key: &str, data: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        let len = data.len();
        debug!(cache = %self.name, key, bytes = len, "filesystem cache store");
        self.write_atomic(&self.data_path(key), &data).await?;
        self.observer.operation("set", "none", len);
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
        match tokio::fs::read(self.data_path(key)).await {
            Ok(data) => {
                debug!(cache = %self.name, key, "filesystem cache retrieve");
                self.observer.operation("get", "hit", data.len());
                self.index.update_object_access_time(key);
                Ok(data)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(self.observer.miss(key))
            }
            Err(e) => {
                self.observer.event("error", "read");
                Err(Error::CacheRead(e.to_string()))
            }
        }
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) {
        self.index.set_expiration(key, ttl);
    }

    async fn remove(&self, key: &str) {
        debug!(cache = %self.name, key, "filesystem cache remove");
        let _ = tokio::fs::remove_file(self.data_path(key)).await;
        self.index.remove_object(key);
        self.observer.operation("del", "none", 0);
    }

    async fn bulk_remove(&self, keys: &[String]) {
        for key in keys {
            let _ = tokio::fs::remove_file(self.data_path(key)).await;
            self.index.remove_object(key);
        }
    }

    async fn close(&self) -> Result<(), Error> {
        // final index flush so a clean shutdown loses nothing
        let data = self.index.to_bytes();
        self.write_atomic(&self.root.join(INDEX_FILENAME), &data)
            .await
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

    fn new_cache() -> FilesystemCache {
        let seq = TEST_SEQ.fetch_add(1, Ordering::SeqCst);
        let config = CachingConfig {
            cache_type: "filesystem".to_string(),
            filesystem: crate::config::FilesystemCacheConfig {
                cache_path: std::env::temp_dir()
                    .join(format!("trickster-fs-test-{}-{}", std::process::id(), seq))
                    .to_string_lossy()
                    .to_string(),
            },
            ..Default::default()
        };
        FilesystemCache::new(
            "test",
            config,
            Arc::new(ProxyMetrics::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let fc = new_cache();
        fc.connect().await.unwrap();
        fc.store("abc123", b"data".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let data = fc.retrieve("abc123", false).await.unwrap();
        assert_eq!(data, b"data");
        fc.remove("abc123").await;
        assert!(fc.retrieve("abc123", false).await.is_err());
    }

    #[tokio::test]
    async fn test_expiration() {
        let fc = new_cache();
        fc.connect().await.unwrap();
        fc.store("k", b"data".to_vec(), Duration::from_nanos(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(fc.retrieve("k", false).await.is_err());
    }

    #[tokio::test]
    async fn test_index_survives_reconnect() {
        let fc = new_cache();
        fc.connect().await.unwrap();
        fc.store("k", b"data".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        fc.close().await.unwrap();

        let fc2 = FilesystemCache::new(
            "test",
            fc.config.clone(),
            Arc::new(ProxyMetrics::new()),
            CancellationToken::new(),
        );
        fc2.connect().await.unwrap();
        assert_eq!(fc2.index.object_count(), 1);
        assert_eq!(fc2.retrieve("k", false).await.unwrap(), b"data");
    }
}
