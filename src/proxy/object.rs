use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::index::now_ns;
use crate::cache::locker::Locker;
use crate::cache::{Cache, LookupStatus};
use crate::error::Error;
use crate::origins::OriginClient;
use crate::proxy::EngineResponse;
use crate::proxy::request::{FetchResponse, ProxyRequest};

/// The object-cache record: status, selected headers, body, and the
/// freshness window computed at store time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpDocument {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub stored_at_ns: i64,
    pub expires_ns: i64,
}

impl HttpDocument {
    fn from_fetch(response: &FetchResponse, freshness: Duration) -> Self {
        let now = now_ns();
        Self {
            status_code: response.status,
            headers: response
                .headers
                .iter()
                .filter_map(|(k, v)| {
                    v.to_str()
                        .ok()
                        .map(|v| (k.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body: response.body.to_vec(),
            stored_at_ns: now,
            expires_ns: now + freshness.as_nanos() as i64,
        }
    }

    fn is_fresh(&self) -> bool {
        self.expires_ns > now_ns()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(k.as_bytes()),
                HeaderValue::from_str(v),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    fn etag(&self) -> Option<&str> {
        self.header("etag")
    }

    fn last_modified(&self) -> Option<&str> {
        self.header("last-modified")
    }

    fn can_revalidate(&self) -> bool {
        self.etag().is_some() || self.last_modified().is_some()
    }
}

/// Parsed `Cache-Control` (and HTTP/1.0 `Pragma`) directives.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub private: bool,
    pub only_if_cached: bool,
    pub must_revalidate: bool,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
}

pub fn parse_cache_control(headers: &HeaderMap) -> CacheControl {
    let mut cc = CacheControl::default();
    for value in headers.get_all(hyper::header::CACHE_CONTROL) {
        let Ok(value) = value.to_str() else { continue };
        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            match directive.as_str() {
                "no-store" => cc.no_store = true,
                "no-cache" => cc.no_cache = true,
                "private" => cc.private = true,
                "only-if-cached" => cc.only_if_cached = true,
                "must-revalidate" | "proxy-revalidate" => cc.must_revalidate = true,
                _ => {
                    if let Some(v) = directive.strip_prefix("max-age=") {
                        cc.max_age = v.parse().ok();
                    } else if let Some(v) = directive.strip_prefix("s-maxage=") {
                        cc.s_maxage = v.parse().ok();
                    }
                }
            }
        }
    }
    // HTTP/1.0 equivalent of Cache-Control: no-cache
    if let Some(pragma) = headers.get(hyper::header::PRAGMA) {
        if pragma
            .to_str()
            .map(|v| v.to_ascii_lowercase().contains("no-cache"))
            .unwrap_or(false)
        {
            cc.no_cache = true;
        }
    }
    cc
}

/// Freshness lifetime for a response. Precedence: response `s-maxage`,
/// response `max-age`, route `default_ttl`, origin `object_ttl`.
fn freshness_lifetime(cc: &CacheControl, request: &ProxyRequest) -> Duration {
    if let Some(s) = cc.s_maxage {
        return Duration::from_secs(s);
    }
    if let Some(m) = cc.max_age {
        return Duration::from_secs(m);
    }
    if request.path_config.default_ttl_ms > 0 {
        return Duration::from_millis(request.path_config.default_ttl_ms);
    }
    request.origin.object_ttl()
}

/// 304 check: strong validator comparison against the client's
/// conditional headers.
fn validators_match(request_headers: &HeaderMap, doc: &HttpDocument) -> bool {
    if let Some(inm) = request_headers
        .get(hyper::header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(etag) = doc.etag() {
            return inm.split(',').map(str::trim).any(|t| t == etag || t == "*");
        }
    }
    if let Some(ims) = request_headers
        .get(hyper::header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(lm) = doc.last_modified() {
            return ims == lm;
        }
    }
    false
}

fn serve_document(
    request: &ProxyRequest,
    doc: &HttpDocument,
    lookup_status: LookupStatus,
) -> EngineResponse {
    if validators_match(&request.headers, doc) {
        return EngineResponse::new(304, lookup_status).with_headers(doc.header_map());
    }
    EngineResponse::new(doc.status_code, lookup_status)
        .with_headers(doc.header_map())
        .with_body(Bytes::from(doc.body.clone()))
}

fn serve_fetched(response: &FetchResponse, lookup_status: LookupStatus) -> EngineResponse {
    EngineResponse::new(response.status, lookup_status)
        .with_headers(response.headers.clone())
        .with_body(response.body.clone())
}

/// Whether and for how long an origin response may be cached.
fn storage_policy(
    response: &FetchResponse,
    request: &ProxyRequest,
) -> Option<(Duration, Duration)> {
    let cc = parse_cache_control(&response.headers);
    if cc.no_store || cc.private {
        return None;
    }
    if (200..300).contains(&response.status) {
        let freshness = freshness_lifetime(&cc, request);
        let has_validators = response.headers.contains_key(hyper::header::ETAG)
            || response.headers.contains_key(hyper::header::LAST_MODIFIED);
        if freshness.is_zero() {
            // an immediately-stale object is still worth keeping when it
            // can be revalidated instead of refetched in full
            if has_validators {
                return Some((Duration::ZERO, request.origin.object_ttl()));
            }
            return None;
        }
        // keep stale copies around for one extra lifetime so validators
        // can revalidate instead of refetching the full body
        let cache_ttl = if has_validators { freshness * 2 } else { freshness };
        return Some((freshness, cache_ttl));
    }
    // negative caching by status class, when configured
    request
        .origin
        .negative_cache_ttl(response.status)
        .map(|ttl| (ttl, ttl))
}

async fn store_response(
    cache: &Arc<dyn Cache>,
    key: &str,
    response: &FetchResponse,
    request: &ProxyRequest,
) -> Option<HttpDocument> {
    let (freshness, cache_ttl) = storage_policy(response, request)?;
    let doc = HttpDocument::from_fetch(response, freshness);
    match serde_json::to_vec(&doc) {
        Ok(bytes) => {
            if let Err(e) = cache.store(key, bytes, cache_ttl).await {
                warn!(key, "object cache write failed: {}", e);
            }
        }
        Err(e) => warn!(key, "object serialization failed: {}", e),
    }
    Some(doc)
}

async fn lookup(cache: &Arc<dyn Cache>, key: &str) -> Option<HttpDocument> {
    match cache.retrieve(key, true).await {
        Ok(bytes) => serde_json::from_slice(&bytes).ok(),
        Err(Error::CacheMiss(_)) => None,
        Err(e) => {
            // read errors degrade to a key miss; the origin still answers
            warn!(key, "object cache read failed: {}", e);
            None
        }
    }
}

/// The generic HTTP caching path, for routes that are cacheable but not
/// time-series aware.
pub async fn object_proxy_cache_request(
    request: &ProxyRequest,
    client: &Arc<dyn OriginClient>,
    cache: &Arc<dyn Cache>,
    locker: &Arc<Locker>,
) -> EngineResponse {
    let key = client.derive_cache_key(request);
    let client_cc = parse_cache_control(&request.headers);

    // client no-cache forces an origin round trip and a refill
    if !client_cc.no_cache {
        let read_lock = locker.rlock(&key).await;
        let cached = lookup(cache, &key).await;
        drop(read_lock);

        match cached {
            Some(doc) if doc.is_fresh() => {
                debug!(key, "object cache hit");
                return serve_document(request, &doc, LookupStatus::Hit);
            }
            Some(doc) if doc.can_revalidate() && !client_cc.only_if_cached => {
                return revalidate(request, cache, locker, &key, doc).await;
            }
            _ => {}
        }
    }

    if client_cc.only_if_cached {
        // RFC 7234: only-if-cached with no fresh copy is a 504
        return EngineResponse::new(504, LookupStatus::KeyMiss);
    }

    // miss path: fill under the write lock
    let write_lock = locker.lock(&key).await;
    if !client_cc.no_cache {
        if let Some(doc) = lookup(cache, &key).await {
            if doc.is_fresh() {
                // another task filled while we waited
                let _read = write_lock.downgrade();
                return serve_document(request, &doc, LookupStatus::Hit);
            }
        }
    }

    let lookup_status = if client_cc.no_cache {
        LookupStatus::Purge
    } else {
        LookupStatus::KeyMiss
    };
    match request.fetch().await {
        Ok(response) => {
            store_response(cache, &key, &response, request).await;
            let _read = write_lock.downgrade();
            serve_fetched(&response, lookup_status)
        }
        Err(e) => {
            drop(write_lock);
            EngineResponse::from_error(&e)
        }
    }
}

/// Stale-with-validators path: one task revalidates against the origin
/// under the write lock while contending readers wait it out.
async fn revalidate(
    request: &ProxyRequest,
    cache: &Arc<dyn Cache>,
    locker: &Arc<Locker>,
    key: &str,
    stale: HttpDocument,
) -> EngineResponse {
    let write_lock = locker.lock(key).await;

    // another task may have revalidated while we waited for the lock
    if let Some(doc) = lookup(cache, key).await {
        if doc.is_fresh() {
            let _read = write_lock.downgrade();
            return serve_document(request, &doc, LookupStatus::Hit);
        }
    }

    let mut conditional = request.clone();
    if let Some(etag) = stale.etag() {
        if let Ok(v) = HeaderValue::from_str(etag) {
            conditional
                .headers
                .insert(hyper::header::IF_NONE_MATCH, v);
        }
    }
    if let Some(lm) = stale.last_modified() {
        if let Ok(v) = HeaderValue::from_str(lm) {
            conditional
                .headers
                .insert(hyper::header::IF_MODIFIED_SINCE, v);
        }
    }

    match conditional.fetch().await {
        Ok(response) if response.status == 304 => {
            debug!(key, "revalidation confirmed cached object");
            let cc = parse_cache_control(&response.headers);
            let freshness = freshness_lifetime(&cc, request);
            let mut refreshed = stale;
            refreshed.stored_at_ns = now_ns();
            refreshed.expires_ns = refreshed.stored_at_ns + freshness.as_nanos() as i64;
            if let Ok(bytes) = serde_json::to_vec(&refreshed) {
                if let Err(e) = cache.store(key, bytes, freshness * 2).await {
                    warn!(key, "object cache write failed: {}", e);
                }
            }
            let _read = write_lock.downgrade();
            serve_document(request, &refreshed, LookupStatus::Hit)
        }
        Ok(response) => {
            store_response(cache, key, &response, request).await;
            let _read = write_lock.downgrade();
            serve_fetched(&response, LookupStatus::KeyMiss)
        }
        Err(e) => {
            drop(write_lock);
            EngineResponse::from_error(&e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cache_control() {
        let mut h = HeaderMap::new();
        h.insert(
            hyper::header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, max-age=60, s-maxage=120"),
        );
        let cc = parse_cache_control(&h);
        assert!(cc.no_cache);
        assert!(!cc.no_store);
        assert_eq!(cc.max_age, Some(60));
        assert_eq!(cc.s_maxage, Some(120));
    }

    #[test]
    fn test_pragma_no_cache() {
        let mut h = HeaderMap::new();
        h.insert(hyper::header::PRAGMA, HeaderValue::from_static("no-cache"));
        assert!(parse_cache_control(&h).no_cache);
    }

    fn fetch_response(status: u16, headers: &[(&str, &str)]) -> FetchResponse {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        FetchResponse {
            status,
            headers: map,
            body: Bytes::from_static(b"body"),
        }
    }

    fn proxy_request() -> ProxyRequest {
        ProxyRequest {
            origin_name: "o".to_string(),
            origin: Arc::new(crate::config::OriginConfig::default()),
            path_config: Arc::new(crate::config::PathConfig::default()),
            method: "GET".to_string(),
            scheme: "http".to_string(),
            authority: "origin".to_string(),
            path: "/".to_string(),
            params: Vec::new(),
            template_params: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: String::new(),
        }
    }

    #[test]
    fn test_storage_policy_no_store() {
        let r = fetch_response(200, &[("cache-control", "no-store")]);
        assert!(storage_policy(&r, &proxy_request()).is_none());
        let r = fetch_response(200, &[("cache-control", "private")]);
        assert!(storage_policy(&r, &proxy_request()).is_none());
    }

    #[test]
    fn test_storage_policy_ttl_precedence() {
        let r = fetch_response(200, &[("cache-control", "max-age=60, s-maxage=120")]);
        let (freshness, _) = storage_policy(&r, &proxy_request()).unwrap();
        assert_eq!(freshness, Duration::from_secs(120));

        let r = fetch_response(200, &[("cache-control", "max-age=60")]);
        let (freshness, _) = storage_policy(&r, &proxy_request()).unwrap();
        assert_eq!(freshness, Duration::from_secs(60));

        let r = fetch_response(200, &[]);
        let mut request = proxy_request();
        let mut pc = crate::config::PathConfig::default();
        pc.default_ttl_ms = 5_000;
        request.path_config = Arc::new(pc);
        let (freshness, _) = storage_policy(&r, &request).unwrap();
        assert_eq!(freshness, Duration::from_secs(5));
    }

    #[test]
    fn test_storage_policy_negative_caching() {
        let r = fetch_response(404, &[]);
        assert!(storage_policy(&r, &proxy_request()).is_none());

        let mut origin = crate::config::OriginConfig::default();
        origin
            .negative_cache
            .insert("404".to_string(), 3_000);
        let mut request = proxy_request();
        request.origin = Arc::new(origin);
        let (freshness, _) = storage_policy(&r, &request).unwrap();
        assert_eq!(freshness, Duration::from_secs(3));
    }

    #[test]
    fn test_revalidation_window_for_validators() {
        let r = fetch_response(200, &[("cache-control", "max-age=60"), ("etag", "\"abc\"")]);
        let (freshness, cache_ttl) = storage_policy(&r, &proxy_request()).unwrap();
        assert_eq!(cache_ttl, freshness * 2);
    }

    #[test]
    fn test_validators_match() {
        let doc = HttpDocument {
            status_code: 200,
            headers: vec![
                ("etag".to_string(), "\"abc\"".to_string()),
                (
                    "last-modified".to_string(),
                    "Wed, 01 Jan 2025 00:00:00 GMT".to_string(),
                ),
            ],
            body: Vec::new(),
            stored_at_ns: 0,
            expires_ns: 0,
        };
        let mut h = HeaderMap::new();
        h.insert(
            hyper::header::IF_NONE_MATCH,
            HeaderValue::from_static("\"abc\""),
        );
        assert!(validators_match(&h, &doc));

        let mut h = HeaderMap::new();
        h.insert(
            hyper::header::IF_MODIFIED_SINCE,
            HeaderValue::from_static("Wed, 01 Jan 2025 00:00:00 GMT"),
        );
        assert!(validators_match(&h, &doc));

        let mut h = HeaderMap::new();
        h.insert(
            hyper::header::IF_NONE_MATCH,
            HeaderValue::from_static("\"other\""),
        );
        assert!(!validators_match(&h, &doc));
    }

    #[test]
    fn test_document_round_trip() {
        let response = fetch_response(200, &[("content-type", "application/json")]);
        let doc = HttpDocument::from_fetch(&response, Duration::from_secs(60));
        assert!(doc.is_fresh());
        let bytes = serde_json::to_vec(&doc).unwrap();
        let back: HttpDocument = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.status_code, 200);
        assert_eq!(back.body, b"body");
        assert_eq!(back.header("content-type"), Some("application/json"));
    }
}
