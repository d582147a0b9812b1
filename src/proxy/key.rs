use base64::Engine;
use hyper::header::HeaderMap;
use sha2::{Digest, Sha256};

use crate::config::PathConfig;

/// Derives the request fingerprint used for cache keys and lock names.
///
/// The digest covers the origin name, method, path, the query parameters
/// and headers whitelisted by the route config, and the username from any
/// Basic Authorization header, so differently-authorized users never share
/// a cached object. Parameters are folded in sorted order so equivalent
/// requests with reordered queries hash identically.
pub fn derive_cache_key(
    origin_name: &str,
    path_config: &PathConfig,
    method: &str,
    path: &str,
    params: &[(String, String)],
    headers: &HeaderMap,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(origin_name.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(method.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(path.as_bytes());

    let mut selected: Vec<(&str, &str)> = params
        .iter()
        .filter(|(k, _)| {
            path_config.cache_key_params.is_empty()
                || path_config.cache_key_params.iter().any(|p| p == k)
        })
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    selected.sort();
    for (k, v) in selected {
        hasher.update(b"\x1f");
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
    }

    for name in &path_config.cache_key_headers {
        if let Some(value) = headers.get(name.as_str()) {
            hasher.update(b"\x1f");
            hasher.update(name.to_ascii_lowercase().as_bytes());
            hasher.update(b":");
            hasher.update(value.as_bytes());
        }
    }

    if let Some(user) = authorization_user(headers) {
        hasher.update(b"\x1f");
        hasher.update(user.as_bytes());
    }

    hex(&hasher.finalize())
}

/// The username portion of a Basic Authorization header, when present and
/// decodable.
fn authorization_user(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(hyper::header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let creds = String::from_utf8(decoded).ok()?;
    Some(creds.split(':').next().unwrap_or_default().to_string())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn pc(params: &[&str], headers: &[&str]) -> PathConfig {
        PathConfig {
            cache_key_params: params.iter().map(|s| s.to_string()).collect(),
            cache_key_headers: headers.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn kv(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_key_is_deterministic_and_order_insensitive() {
        let config = pc(&["query", "step"], &[]);
        let h = HeaderMap::new();
        let a = derive_cache_key("o", &config, "GET", "/q", &kv(&[("query", "up"), ("step", "15")]), &h);
        let b = derive_cache_key("o", &config, "GET", "/q", &kv(&[("step", "15"), ("query", "up")]), &h);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_unselected_params_ignored() {
        let config = pc(&["query"], &[]);
        let h = HeaderMap::new();
        let a = derive_cache_key("o", &config, "GET", "/q", &kv(&[("query", "up"), ("ts", "1")]), &h);
        let b = derive_cache_key("o", &config, "GET", "/q", &kv(&[("query", "up"), ("ts", "2")]), &h);
        assert_eq!(a, b);
    }

    #[test]
    fn test_selected_param_changes_key() {
        let config = pc(&["query"], &[]);
        let h = HeaderMap::new();
        let a = derive_cache_key("o", &config, "GET", "/q", &kv(&[("query", "up")]), &h);
        let b = derive_cache_key("o", &config, "GET", "/q", &kv(&[("query", "down")]), &h);
        assert_ne!(a, b);
    }

    #[test]
    fn test_authorization_user_partitions_keys() {
        let config = pc(&[], &[]);
        let mut h1 = HeaderMap::new();
        // alice:secret
        h1.insert(
            hyper::header::AUTHORIZATION,
            HeaderValue::from_static("Basic YWxpY2U6c2VjcmV0"),
        );
        let mut h2 = HeaderMap::new();
        // bob:secret
        h2.insert(
            hyper::header::AUTHORIZATION,
            HeaderValue::from_static("Basic Ym9iOnNlY3JldA=="),
        );
        let a = derive_cache_key("o", &config, "GET", "/q", &[], &h1);
        let b = derive_cache_key("o", &config, "GET", "/q", &[], &h2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_selected_header_changes_key() {
        let config = pc(&[], &["x-tenant"]);
        let mut h1 = HeaderMap::new();
        h1.insert("x-tenant", HeaderValue::from_static("t1"));
        let mut h2 = HeaderMap::new();
        h2.insert("x-tenant", HeaderValue::from_static("t2"));
        let a = derive_cache_key("o", &config, "GET", "/q", &[], &h1);
        let b = derive_cache_key("o", &config, "GET", "/q", &[], &h2);
        assert_ne!(a, b);
    }
}
