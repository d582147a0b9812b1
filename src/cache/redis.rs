use async_trait::async_trait;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::{Cache, CacheObserver};
use crate::config::CachingConfig;
use crate::error::Error;
use crate::metrics::ProxyMetrics;

/// Live connection to the configured Redis deployment. Both variants are
/// cheap to clone; ops clone a handle out of the slot rather than holding
/// the lock across I/O.
#[derive(Clone)]
enum RedisConnection {
    Standard(redis::aio::ConnectionManager),
    Cluster(redis::cluster_async::ClusterConnection),
}

/// Remote byte store on Redis. Self-managing: TTLs are native (`SET EX`)
/// and Redis handles its own eviction, so the cache index is not involved.
/// Supports standalone endpoints, cluster mode, and sentinel-fronted
/// deployments (master discovered with `SENTINEL get-master-addr-by-name`).
pub struct RedisCache {
    name: String,
    config: CachingConfig,
    conn: tokio::sync::RwLock<Option<RedisConnection>>,
    observer: CacheObserver,
}

impl RedisCache {
    pub fn new(name: &str, config: CachingConfig, metrics: Arc<ProxyMetrics>) -> Self {
        let observer = CacheObserver::new(name, &config.cache_type, metrics);
        Self {
            name: name.to_string(),
            config,
            conn: tokio::sync::RwLock::new(None),
            observer,
        }
    }

    /// Applies password and db selection to a bare endpoint URL.
    fn build_url(&self, endpoint: &str) -> String {
        let mut url = if endpoint.starts_with("redis://") || endpoint.starts_with("rediss://") {
            endpoint.to_string()
        } else {
            format!("redis://{}", endpoint)
        };
        if let Some(password) = &self.config.redis.password {
            if !url.contains('@') {
                url = url.replacen("://", &format!("://:{}@", password), 1);
            }
        }
        if self.config.redis.db != 0 && url.matches('/').count() < 3 {
            url = format!("{}/{}", url, self.config.redis.db);
        }
        url
    }

    async fn connection(&self) -> Result<RedisConnection, Error> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::CacheRead("redis not connected".to_string()))
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn connect(&self) -> Result<(), Error> {
        let rc = &self.config.redis;
        info!(
            cache = %self.name,
            client_type = %rc.client_type,
            endpoint = %rc.endpoint,
            "connecting to redis"
        );
        let connection = match rc.client_type.as_str() {
            "standard" => {
                let client = redis::Client::open(self.build_url(&rc.endpoint))
                    .map_err(|e| Error::Config(format!("redis: {}", e)))?;
                let manager = redis::aio::ConnectionManager::new(client)
                    .await
                    .map_err(|e| Error::CacheRead(format!("redis connect: {}", e)))?;
                RedisConnection::Standard(manager)
            }
            "cluster" => {
                let urls: Vec<String> = if rc.endpoints.is_empty() {
                    vec![self.build_url(&rc.endpoint)]
                } else {
                    rc.endpoints.iter().map(|e| self.build_url(e)).collect()
                };
                let client = redis::cluster::ClusterClient::new(urls)
                    .map_err(|e| Error::Config(format!("redis cluster: {}", e)))?;
                let conn = client
                    .get_async_connection()
                    .await
                    .map_err(|e| Error::CacheRead(format!("redis cluster connect: {}", e)))?;
                RedisConnection::Cluster(conn)
            }
            "sentinel" => {
                // ask any sentinel for the current master, then connect
                // to it as a standard endpoint
                let sentinel = redis::Client::open(self.build_url(&rc.endpoint))
                    .map_err(|e| Error::Config(format!("redis sentinel: {}", e)))?;
                let mut scon = sentinel
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(|e| Error::CacheRead(format!("sentinel connect: {}", e)))?;
                let (host, port): (String, String) = redis::cmd("SENTINEL")
                    .arg("get-master-addr-by-name")
                    .arg(&rc.sentinel_master)
                    .query_async(&mut scon)
                    .await
                    .map_err(|e| Error::CacheRead(format!("sentinel discovery: {}", e)))?;
                info!(cache = %self.name, master = %format!("{}:{}", host, port), "sentinel master discovered");
                let client = redis::Client::open(self.build_url(&format!("{}:{}", host, port)))
                    .map_err(|e| Error::Config(format!("redis: {}", e)))?;
                let manager = redis::aio::ConnectionManager::new(client)
                    .await
                    .map_err(|e| Error::CacheRead(format!("redis connect: {}", e)))?;
                RedisConnection::Standard(manager)
            }
            other => {
                return Err(Error::Config(format!(
                    "cache {}: unknown redis client_type {}",
                    self.name, other
                )));
            }
        };
        *self.conn.write().await = Some(connection);
        Ok(())
    }

    async fn store(&self, key: &str, data: Vec<u8>, ttl: Duration) -> Result<(), Error> {
        let len = data.len();
        debug!(cache = %self.name, key, bytes = len, "redis cache store");
        self.observer.operation("set", "none", len);
        let result = match self.connection().await? {
            RedisConnection::Standard(mut c) => {
                if ttl.is_zero() {
                    c.set::<_, _, ()>(key, data).await
                } else {
                    c.set_ex::<_, _, ()>(key, data, ttl.as_secs().max(1)).await
                }
            }
            RedisConnection::Cluster(mut c) => {
                if ttl.is_zero() {
                    c.set::<_, _, ()>(key, data).await
                } else {
                    c.set_ex::<_, _, ()>(key, data, ttl.as_secs().max(1)).await
                }
            }
        };
        result.map_err(|e| Error::CacheWrite(e.to_string()))
    }

    async fn retrieve(&self, key: &str, _allow_expired: bool) -> Result<Vec<u8>, Error> {
        let result: Result<Option<Vec<u8>>, redis::RedisError> =
            match self.connection().await? {
                RedisConnection::Standard(mut c) => c.get(key).await,
                RedisConnection::Cluster(mut c) => c.get(key).await,
            };
        match result {
            Ok(Some(data)) => {
                debug!(cache = %self.name, key, "redis cache retrieve");
                self.observer.operation("get", "hit", data.len());
                Ok(data)
            }
            Ok(None) => Err(self.observer.miss(key)),
            Err(e) => {
                self.observer.event("error", "read");
                Err(Error::CacheRead(e.to_string()))
            }
        }
    }

    async fn set_ttl(&self, key: &str, ttl: Duration) {
        if let Ok(conn) = self.connection().await {
            let secs = ttl.as_secs().max(1) as i64;
            let _ = match conn {
                RedisConnection::Standard(mut c) => c.expire::<_, ()>(key, secs).await,
                RedisConnection::Cluster(mut c) => c.expire::<_, ()>(key, secs).await,
            };
        }
    }

    async fn remove(&self, key: &str) {
        debug!(cache = %self.name, key, "redis cache remove");
        self.observer.operation("del", "none", 0);
        if let Ok(conn) = self.connection().await {
            let _ = match conn {
                RedisConnection::Standard(mut c) => c.del::<_, ()>(key).await,
                RedisConnection::Cluster(mut c) => c.del::<_, ()>(key).await,
            };
        }
    }

    async fn bulk_remove(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        if let Ok(conn) = self.connection().await {
            let _ = match conn {
                RedisConnection::Standard(mut c) => c.del::<_, ()>(keys).await,
                RedisConnection::Cluster(mut c) => c.del::<_, ()>(keys).await,
            };
        }
    }

    async fn close(&self) -> Result<(), Error> {
        info!(cache = %self.name, "closing redis connection");
        *self.conn.write().await = None;
        Ok(())
    }

    fn configuration(&self) -> &CachingConfig {
        &self.config
    }

    fn name(&self) -> &str {
        &self.name
    }
}
