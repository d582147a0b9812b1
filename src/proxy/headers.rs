use hyper::header::{HeaderMap, HeaderName, HeaderValue};

use crate::cache::LookupStatus;
use crate::config::{APPLICATION_NAME, APPLICATION_VERSION};
use crate::timeseries::ExtentList;

// Common header names not covered by hyper's constants
pub const X_ACCELERATOR: &str = "x-accelerator";
pub const X_FORWARDED_BY: &str = "x-forwarded-by";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_TRICKSTER_RESULT: &str = "x-trickster-result";

/// RFC 7230 hop-by-hop headers, stripped in both directions.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Removes hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let nominated: Vec<String> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(',').map(|s| s.trim().to_ascii_lowercase()))
        .collect();
    for name in nominated {
        if let Ok(hn) = HeaderName::from_bytes(name.as_bytes()) {
            headers.remove(hn);
        }
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Appends the forwarding identity headers to an upstream request.
pub fn add_proxy_headers(remote_addr: &str, headers: &mut HeaderMap) {
    if remote_addr.is_empty() {
        return;
    }
    append(headers, X_FORWARDED_FOR, remote_addr);
    append(
        headers,
        X_FORWARDED_BY,
        &format!("{} {}", APPLICATION_NAME, APPLICATION_VERSION),
    );
}

/// Stamps the standard downstream response headers. We are a read-only,
/// harmless API, so CORS allows all.
pub fn add_response_headers(headers: &mut HeaderMap) {
    headers.insert(
        hyper::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    set(
        headers,
        X_ACCELERATOR,
        &format!("{} {}", APPLICATION_NAME, APPLICATION_VERSION),
    );
}

/// Writes the engine result header that describes how the request was
/// serviced, e.g. `engine=DeltaProxyCache; status=phit; fetched=150-180`.
pub fn set_result_header(
    headers: &mut HeaderMap,
    engine: &str,
    status: LookupStatus,
    fetched: Option<&ExtentList>,
) {
    let mut value = format!("engine={}; status={}", engine, status);
    if let Some(extents) = fetched {
        if !extents.is_empty() {
            value.push_str(&format!("; fetched={}", extents));
        }
    }
    set(headers, X_TRICKSTER_RESULT, &value);
}

/// Applies a path config's header mutations: a value of `""` deletes the
/// header, anything else replaces it.
pub fn apply_header_mutations(
    headers: &mut HeaderMap,
    mutations: &std::collections::HashMap<String, String>,
) {
    for (name, value) in mutations {
        let Ok(hn) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        if value.is_empty() {
            headers.remove(&hn);
        } else if let Ok(hv) = HeaderValue::from_str(value) {
            headers.insert(hn, hv);
        }
    }
}

fn set(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(hv) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), hv);
    }
}

fn append(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(hv) = HeaderValue::from_str(value) {
        headers.append(HeaderName::from_static(name), hv);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeseries::Extent;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut h = HeaderMap::new();
        h.insert(
            hyper::header::CONNECTION,
            HeaderValue::from_static("close, x-internal-token"),
        );
        h.insert("x-internal-token", HeaderValue::from_static("secret"));
        h.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        h.insert("content-type", HeaderValue::from_static("application/json"));
        strip_hop_by_hop(&mut h);
        assert!(h.get("connection").is_none());
        assert!(h.get("keep-alive").is_none());
        assert!(h.get("x-internal-token").is_none());
        assert!(h.get("content-type").is_some());
    }

    #[test]
    fn test_proxy_headers_appended() {
        let mut h = HeaderMap::new();
        add_proxy_headers("10.0.0.1", &mut h);
        assert_eq!(h.get(X_FORWARDED_FOR).unwrap(), "10.0.0.1");
        assert!(h
            .get(X_FORWARDED_BY)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with(APPLICATION_NAME));
    }

    #[test]
    fn test_result_header() {
        let mut h = HeaderMap::new();
        let fetched = ExtentList::single(Extent::new(150, 180));
        set_result_header(&mut h, "DeltaProxyCache", LookupStatus::PartialHit, Some(&fetched));
        assert_eq!(
            h.get(X_TRICKSTER_RESULT).unwrap(),
            "engine=DeltaProxyCache; status=phit; fetched=150-180"
        );
    }

    #[test]
    fn test_header_mutations() {
        let mut h = HeaderMap::new();
        h.insert("x-drop-me", HeaderValue::from_static("1"));
        let mut mutations = std::collections::HashMap::new();
        mutations.insert("x-drop-me".to_string(), String::new());
        mutations.insert("x-added".to_string(), "yes".to_string());
        apply_header_mutations(&mut h, &mutations);
        assert!(h.get("x-drop-me").is_none());
        assert_eq!(h.get("x-added").unwrap(), "yes");
    }
}
