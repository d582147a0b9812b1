use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const APPLICATION_NAME: &str = "trickster";
pub const APPLICATION_VERSION: &str = "1.0.0";

/// Top-level process configuration, deserialized from a TOML file and
/// overlaid with the whitelisted command-line flags.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct TricksterConfig {
    pub main: MainConfig,
    pub frontend: FrontendConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
    /// Named upstream origins. At least one must be flagged `is_default`
    /// (or be the only entry) to receive unprefixed paths.
    pub origins: HashMap<String, OriginConfig>,
    /// Named cache configurations referenced by `OriginConfig.cache_name`.
    pub caches: HashMap<String, CachingConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct MainConfig {
    /// Distinguishes multiple instances running from one config file.
    pub instance_id: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct FrontendConfig {
    pub listen_address: String,
    pub listen_port: u16,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 9090,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub listen_address: String,
    pub listen_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            listen_port: 8082,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// debug, info, warn, or error.
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Per-origin proxy configuration: where the origin lives, how its
/// timeseries are cached, and the route overlay for its paths.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct OriginConfig {
    /// prometheus or influxdb.
    pub origin_type: String,
    /// Base URL of the upstream, e.g. `http://prometheus:9090`.
    pub origin_url: String,
    /// Receives unprefixed request paths when set.
    pub is_default: bool,
    /// Name of the cache (in `[caches]`) backing this origin.
    pub cache_name: String,
    /// Upstream request deadline.
    pub timeout_ms: u64,
    /// Age below which samples are considered volatile and never served
    /// from cache.
    pub backfill_tolerance_ms: u64,
    /// Maximum timestamps retained per cached fingerprint.
    pub timeseries_retention_factor: usize,
    /// TTL for delta-cache entries.
    pub timeseries_ttl_ms: u64,
    /// TTL for object-cache entries when the response carries no caching
    /// directives and the route has no default.
    pub object_ttl_ms: u64,
    /// Disables the fast-forward fetch for this origin.
    pub fast_forward_disable: bool,
    /// TTL of the fast-forward side cache. Bounded by one step at runtime.
    pub fast_forward_ttl_ms: u64,
    /// Bound on concurrent delta fetches against this origin.
    pub max_concurrent_fetches: usize,
    /// Queue depth beyond which engines short-circuit to proxy-only.
    pub max_queue_depth: usize,
    /// TTLs for negative caching, keyed by upstream status code string.
    pub negative_cache: HashMap<String, u64>,
    /// User route overlay, merged over the client's default paths.
    pub paths: HashMap<String, PathConfig>,
    /// Optional TLS certificate presented for this origin's routes.
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            origin_type: "prometheus".to_string(),
            origin_url: "http://localhost:9090".to_string(),
            is_default: false,
            cache_name: "default".to_string(),
            timeout_ms: 180_000,
            backfill_tolerance_ms: 0,
            timeseries_retention_factor: 1024,
            timeseries_ttl_ms: 21_600_000,
            object_ttl_ms: 30_000,
            fast_forward_disable: false,
            fast_forward_ttl_ms: 15_000,
            max_concurrent_fetches: 8,
            max_queue_depth: 64,
            negative_cache: HashMap::new(),
            paths: HashMap::new(),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

impl OriginConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    pub fn backfill_tolerance_ns(&self) -> i64 {
        self.backfill_tolerance_ms as i64 * 1_000_000
    }

    pub fn timeseries_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeseries_ttl_ms)
    }

    pub fn object_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.object_ttl_ms)
    }

    /// Negative-cache TTL for `status`, if one is configured.
    pub fn negative_cache_ttl(&self, status: u16) -> Option<std::time::Duration> {
        self.negative_cache
            .get(&status.to_string())
            .map(|ms| std::time::Duration::from_millis(*ms))
    }
}

/// How requests matching a path are handled.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PathHandler {
    /// Generic HTTP object caching.
    ProxyCache,
    /// Time-series aware delta caching.
    DeltaProxyCache,
    /// Pass through to the origin, no cache.
    #[default]
    Proxy,
    /// Short-circuit with a configured body.
    LocalResponse,
    /// Probe the origin's health endpoint.
    Health,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PathMatchType {
    #[default]
    Exact,
    Prefix,
}

/// A single route under an origin. Defaults come from the origin client's
/// `default_path_configs`; user entries overlay by path string.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct PathConfig {
    pub path: String,
    pub handler: PathHandler,
    pub methods: Vec<String>,
    pub match_type: PathMatchType,
    /// Query parameters included in the cache fingerprint.
    pub cache_key_params: Vec<String>,
    /// Request headers included in the cache fingerprint.
    pub cache_key_headers: Vec<String>,
    /// Headers injected into the upstream request. An empty value removes
    /// the header.
    pub request_headers: HashMap<String, String>,
    /// Headers injected into the downstream response.
    pub response_headers: HashMap<String, String>,
    /// Status for `localresponse` routes.
    pub response_code: u16,
    /// Body for `localresponse` routes.
    pub response_body: Option<String>,
    /// Object-cache TTL for this route when the response carries no
    /// caching directives.
    pub default_ttl_ms: u64,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            handler: PathHandler::Proxy,
            methods: vec!["GET".to_string()],
            match_type: PathMatchType::Exact,
            cache_key_params: Vec::new(),
            cache_key_headers: Vec::new(),
            request_headers: HashMap::new(),
            response_headers: HashMap::new(),
            response_code: 200,
            response_body: None,
            default_ttl_ms: 0,
        }
    }
}

/// Configuration for one named cache.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CachingConfig {
    /// memory, filesystem, rocksdb, or redis.
    pub cache_type: String,
    pub index: CacheIndexConfig,
    pub filesystem: FilesystemCacheConfig,
    pub rocksdb: RocksDBCacheConfig,
    pub redis: RedisCacheConfig,
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            cache_type: "memory".to_string(),
            index: CacheIndexConfig::default(),
            filesystem: FilesystemCacheConfig::default(),
            rocksdb: RocksDBCacheConfig::default(),
            redis: RedisCacheConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheIndexConfig {
    pub reap_interval_ms: u64,
    pub flush_interval_ms: u64,
    pub max_size_bytes: u64,
    pub max_size_backoff_bytes: u64,
    pub max_size_objects: u64,
    pub max_size_backoff_objects: u64,
}

impl Default for CacheIndexConfig {
    fn default() -> Self {
        Self {
            reap_interval_ms: 3_000,
            flush_interval_ms: 5_000,
            max_size_bytes: 536_870_912,
            max_size_backoff_bytes: 16_777_216,
            max_size_objects: 0,
            max_size_backoff_objects: 100,
        }
    }
}

impl CacheIndexConfig {
    pub fn reap_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reap_interval_ms)
    }

    pub fn flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct FilesystemCacheConfig {
    pub cache_path: String,
}

impl Default for FilesystemCacheConfig {
    fn default() -> Self {
        Self {
            cache_path: "/tmp/trickster".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RocksDBCacheConfig {
    pub path: String,
}

impl Default for RocksDBCacheConfig {
    fn default() -> Self {
        Self {
            path: "/tmp/trickster-rocksdb".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RedisCacheConfig {
    /// standard, cluster, or sentinel.
    pub client_type: String,
    /// Endpoint for standard; any sentinel endpoint for sentinel.
    pub endpoint: String,
    /// All node endpoints for cluster.
    pub endpoints: Vec<String>,
    pub password: Option<String>,
    pub db: i64,
    /// Master set name for sentinel.
    pub sentinel_master: String,
}

impl Default for RedisCacheConfig {
    fn default() -> Self {
        Self {
            client_type: "standard".to_string(),
            endpoint: "redis://127.0.0.1:6379".to_string(),
            endpoints: Vec::new(),
            password: None,
            db: 0,
            sentinel_master: "mymaster".to_string(),
        }
    }
}

/// Whitelisted command-line flags, mirrored onto the config after the file
/// loads.
#[derive(Debug, Default)]
pub struct Flags {
    pub print_version: bool,
    pub config_path: Option<String>,
    pub origin_url: Option<String>,
    pub origin_type: Option<String>,
    pub proxy_port: Option<u16>,
    pub metrics_port: Option<u16>,
    pub log_level: Option<String>,
}

impl Flags {
    /// Parses `arguments` (without the program name). Unknown flags are a
    /// configuration error.
    pub fn parse(arguments: &[String]) -> Result<Flags, crate::error::Error> {
        let mut flags = Flags::default();
        let mut i = 0;
        while i < arguments.len() {
            let arg = arguments[i].trim_start_matches('-');
            match arg {
                "version" => flags.print_version = true,
                "config" | "origin" | "origin-type" | "proxy-port" | "metrics-port"
                | "log-level" => {
                    i += 1;
                    let val = arguments.get(i).ok_or_else(|| {
                        crate::error::Error::Config(format!("flag -{} requires a value", arg))
                    })?;
                    match arg {
                        "config" => flags.config_path = Some(val.clone()),
                        "origin" => flags.origin_url = Some(val.clone()),
                        "origin-type" => flags.origin_type = Some(val.clone()),
                        "proxy-port" => {
                            flags.proxy_port = Some(val.parse().map_err(|_| {
                                crate::error::Error::Config(format!("invalid port: {}", val))
                            })?)
                        }
                        "metrics-port" => {
                            flags.metrics_port = Some(val.parse().map_err(|_| {
                                crate::error::Error::Config(format!("invalid port: {}", val))
                            })?)
                        }
                        "log-level" => flags.log_level = Some(val.clone()),
                        _ => unreachable!(),
                    }
                }
                other => {
                    return Err(crate::error::Error::Config(format!(
                        "unknown flag: -{}",
                        other
                    )));
                }
            }
            i += 1;
        }
        Ok(flags)
    }
}

/// Loads the TOML config file (if present), applies flags, and validates.
pub fn load(arguments: &[String]) -> Result<(TricksterConfig, Flags), crate::error::Error> {
    let flags = Flags::parse(arguments)?;

    let mut cfg = match &flags.config_path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .map_err(|e| crate::error::Error::Config(format!("{}: {}", path, e)))?;
            toml::from_str::<TricksterConfig>(&content)
                .map_err(|e| crate::error::Error::Config(format!("{}: {}", path, e)))?
        }
        None => match std::fs::read_to_string("trickster.conf") {
            Ok(content) => toml::from_str::<TricksterConfig>(&content)
                .map_err(|e| crate::error::Error::Config(format!("trickster.conf: {}", e)))?,
            Err(_) => TricksterConfig::default(),
        },
    };

    // The -origin/-origin-type shortcut synthesizes a default origin so the
    // proxy can run with no config file at all.
    if let Some(url) = &flags.origin_url {
        let entry = cfg
            .origins
            .entry("default".to_string())
            .or_insert_with(OriginConfig::default);
        entry.origin_url = url.clone();
        entry.is_default = true;
        if let Some(t) = &flags.origin_type {
            entry.origin_type = t.clone();
        }
    }
    if let Some(p) = flags.proxy_port {
        cfg.frontend.listen_port = p;
    }
    if let Some(p) = flags.metrics_port {
        cfg.metrics.listen_port = p;
    }
    if let Some(l) = &flags.log_level {
        cfg.logging.log_level = l.clone();
    }

    if cfg.origins.is_empty() {
        return Err(crate::error::Error::Config(
            "no origins configured; provide a config file or -origin".to_string(),
        ));
    }
    for (name, o) in &cfg.origins {
        match o.origin_type.as_str() {
            "prometheus" | "influxdb" => {}
            other => {
                return Err(crate::error::Error::Config(format!(
                    "origin {}: unknown origin_type {}",
                    name, other
                )));
            }
        }
        if !o.origin_url.starts_with("http://") && !o.origin_url.starts_with("https://") {
            return Err(crate::error::Error::Config(format!(
                "origin {}: origin_url must be http(s)",
                name
            )));
        }
    }
    if cfg.caches.is_empty() {
        cfg.caches
            .insert("default".to_string(), CachingConfig::default());
    }
    for (name, o) in &cfg.origins {
        if !cfg.caches.contains_key(&o.cache_name) {
            return Err(crate::error::Error::Config(format!(
                "origin {} references unknown cache {}",
                name, o.cache_name
            )));
        }
    }

    Ok((cfg, flags))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_parse() {
        let args: Vec<String> = ["-origin", "http://prom:9090", "-origin-type", "prometheus"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let f = Flags::parse(&args).unwrap();
        assert_eq!(f.origin_url.as_deref(), Some("http://prom:9090"));
        assert_eq!(f.origin_type.as_deref(), Some("prometheus"));
    }

    #[test]
    fn test_flags_unknown_rejected() {
        let args = vec!["-bogus".to_string()];
        assert!(Flags::parse(&args).is_err());
    }

    #[test]
    fn test_load_origin_shortcut() {
        let args: Vec<String> = ["-origin", "http://prom:9090"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let (cfg, _) = load(&args).unwrap();
        let origin = cfg.origins.get("default").unwrap();
        assert!(origin.is_default);
        assert_eq!(origin.origin_url, "http://prom:9090");
        assert!(cfg.caches.contains_key("default"));
    }

    #[test]
    fn test_toml_parse() {
        let doc = r#"
            [frontend]
            listen_port = 8480

            [origins.prom1]
            origin_type = "prometheus"
            origin_url = "http://prometheus:9090"
            is_default = true
            backfill_tolerance_ms = 60000

            [origins.prom1.paths."/custom"]
            path = "/custom"
            handler = "proxycache"
            default_ttl_ms = 120000

            [caches.default]
            cache_type = "memory"
        "#;
        let cfg: TricksterConfig = toml::from_str(doc).unwrap();
        assert_eq!(cfg.frontend.listen_port, 8480);
        let o = cfg.origins.get("prom1").unwrap();
        assert_eq!(o.backfill_tolerance_ns(), 60_000_000_000);
        assert_eq!(
            o.paths.get("/custom").unwrap().handler,
            PathHandler::ProxyCache
        );
    }
}
