use bytes::Bytes;
use flate2::read::GzDecoder;
use http_body_util::{BodyExt, Full};
use hyper::header::HeaderMap;
use hyper_util::rt::TokioIo;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};

use crate::config::{OriginConfig, PathConfig};
use crate::error::Error;
use crate::proxy::headers::{add_proxy_headers, strip_hop_by_hop};

/// A buffered upstream response.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// An outbound request in flight through one of the engines. Carries the
/// live query parameters (which `set_extent` rewrites per delta) alongside
/// the pristine template copy the rewrite interpolates from.
#[derive(Clone)]
pub struct ProxyRequest {
    pub origin_name: String,
    pub origin: Arc<OriginConfig>,
    pub path_config: Arc<PathConfig>,
    pub method: String,
    /// Upstream scheme, from the origin URL.
    pub scheme: String,
    /// Upstream host:port, from the origin URL.
    pub authority: String,
    /// Upstream path: origin path prefix + request path.
    pub path: String,
    pub params: Vec<(String, String)>,
    pub template_params: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: String,
}

impl ProxyRequest {
    /// First value of a live query parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// First value of a template query parameter.
    pub fn template_param(&self, name: &str) -> Option<&str> {
        self.template_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Replaces (or adds) a live query parameter.
    pub fn set_param(&mut self, name: &str, value: String) {
        match self.params.iter_mut().find(|(k, _)| k == name) {
            Some((_, v)) => *v = value,
            None => self.params.push((name.to_string(), value)),
        }
    }

    pub fn remove_param(&mut self, name: &str) {
        self.params.retain(|(k, _)| k != name);
    }

    /// The full upstream URL for the current parameter set.
    pub fn upstream_url(&self) -> String {
        let mut url = format!("{}://{}{}", self.scheme, self.authority, self.path);
        if !self.params.is_empty() {
            let query: String = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish();
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    /// Performs the upstream fetch with the origin's deadline applied,
    /// buffering the whole body. Compressed bodies are transparently
    /// decoded so the codecs always see plain bytes.
    pub async fn fetch(&self) -> Result<FetchResponse, Error> {
        let result = tokio::time::timeout(self.origin.timeout(), self.fetch_inner()).await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::UpstreamTimeout),
        }
    }

    async fn fetch_inner(&self) -> Result<FetchResponse, Error> {
        let mut headers = self.headers.clone();
        strip_hop_by_hop(&mut headers);
        // the codecs need identity bodies; the decode below is a backstop
        headers.remove(hyper::header::ACCEPT_ENCODING);
        // replaced with values for the upstream connection
        headers.remove(hyper::header::HOST);
        headers.remove(hyper::header::CONTENT_LENGTH);
        add_proxy_headers(&self.remote_addr, &mut headers);

        let (status, mut resp_headers, body) = if self.scheme == "https" {
            self.fetch_via_reqwest(headers).await?
        } else {
            self.fetch_via_handshake(headers).await?
        };

        let decoded = decode_body(&resp_headers, body)?;
        // the buffered body is re-framed on the way out
        resp_headers.remove(hyper::header::CONTENT_LENGTH);
        resp_headers.remove(hyper::header::CONTENT_ENCODING);
        Ok(FetchResponse {
            status,
            headers: resp_headers,
            body: decoded,
        })
    }

    /// Plain-HTTP upstream path: one TCP connect and hyper handshake per
    /// fetch, with the connection driver spawned off to its own task.
    async fn fetch_via_handshake(
        &self,
        headers: HeaderMap,
    ) -> Result<(u16, HeaderMap, Bytes), Error> {
        let stream = TcpStream::connect(&self.authority).await.map_err(|e| {
            error!("Failed to connect to origin {}: {}", self.authority, e);
            Error::Upstream(502)
        })?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| {
                error!("Handshake failed with origin {}: {}", self.authority, e);
                Error::Upstream(502)
            })?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("Origin connection error: {:?}", e);
            }
        });

        let mut path_and_query = self.path.clone();
        if !self.params.is_empty() {
            let query: String = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.params.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish();
            path_and_query.push('?');
            path_and_query.push_str(&query);
        }

        let mut builder = hyper::Request::builder()
            .method(self.method.as_str())
            .uri(&path_and_query)
            .header(hyper::header::HOST, self.authority.clone());
        if let Some(hm) = builder.headers_mut() {
            for (name, value) in headers.iter() {
                hm.append(name, value.clone());
            }
        }
        let request = builder
            .body(Full::new(self.body.clone()))
            .map_err(|e| Error::Parse(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| {
                error!("Failed to proxy request to origin {}: {}", self.authority, e);
                Error::Upstream(502)
            })?;

        let status = response.status().as_u16();
        let resp_headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| {
                error!("Failed reading origin body: {}", e);
                Error::Upstream(502)
            })?
            .to_bytes();
        Ok((status, resp_headers, body))
    }

    /// TLS upstream path rides on reqwest rather than hand-rolling a
    /// client-side TLS stack.
    async fn fetch_via_reqwest(
        &self,
        headers: HeaderMap,
    ) -> Result<(u16, HeaderMap, Bytes), Error> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        let mut request = client
            .request(
                self.method
                    .parse()
                    .map_err(|_| Error::Parse(format!("bad method {}", self.method)))?,
                self.upstream_url(),
            )
            .body(self.body.to_vec());
        for (name, value) in headers.iter() {
            if let Ok(v) = value.to_str() {
                request = request.header(name.as_str(), v);
            }
        }
        let response = request.send().await.map_err(|e| {
            error!("Failed to proxy request to origin {}: {}", self.authority, e);
            Error::Upstream(502)
        })?;
        let status = response.status().as_u16();
        let mut resp_headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            resp_headers.append(name.clone(), value.clone());
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Upstream(if e.is_timeout() { 504 } else { 502 }))?;
        Ok((status, resp_headers, body))
    }
}

fn decode_body(headers: &HeaderMap, body: Bytes) -> Result<Bytes, Error> {
    let encoding = headers
        .get(hyper::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if encoding.eq_ignore_ascii_case("gzip") {
        let mut decoder = GzDecoder::new(&body[..]);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::Unmarshal(format!("gzip decode: {}", e)))?;
        Ok(Bytes::from(out))
    } else {
        Ok(body)
    }
}

/// Bounded fan-out pool for delta fetches against one origin. Excess
/// acquisitions queue on the semaphore; once the queue passes
/// `max_queue_depth`, engines short-circuit to proxy-only instead of
/// piling on.
pub struct FetchPool {
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
    max_queue: usize,
    observer: Option<crate::cache::CacheObserver>,
}

impl FetchPool {
    pub fn new(max_concurrent: usize, max_queue: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            queued: AtomicUsize::new(0),
            max_queue,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: crate::cache::CacheObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// True when the waiting line is past the configured depth.
    pub fn is_overloaded(&self) -> bool {
        self.max_queue > 0 && self.queued.load(Ordering::Relaxed) > self.max_queue
    }

    /// Counts an overload short-circuit against the events metric.
    pub fn record_overload(&self) {
        if let Some(observer) = &self.observer {
            observer.event("overloaded", "fetch-queue");
        }
    }

    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.queued.fetch_add(1, Ordering::Relaxed);
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("fetch pool semaphore closed");
        self.queued.fetch_sub(1, Ordering::Relaxed);
        permit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn request() -> ProxyRequest {
        ProxyRequest {
            origin_name: "default".to_string(),
            origin: Arc::new(OriginConfig::default()),
            path_config: Arc::new(PathConfig::default()),
            method: "GET".to_string(),
            scheme: "http".to_string(),
            authority: "origin:9090".to_string(),
            path: "/api/v1/query_range".to_string(),
            params: vec![("query".to_string(), "up".to_string())],
            template_params: vec![("query".to_string(), "up".to_string())],
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: String::new(),
        }
    }

    #[test]
    fn test_param_accessors() {
        let mut r = request();
        assert_eq!(r.param("query"), Some("up"));
        r.set_param("start", "100".to_string());
        r.set_param("query", "down".to_string());
        assert_eq!(r.param("start"), Some("100"));
        assert_eq!(r.param("query"), Some("down"));
        assert_eq!(r.template_param("query"), Some("up"));
        r.remove_param("start");
        assert_eq!(r.param("start"), None);
    }

    #[test]
    fn test_upstream_url_encodes_query() {
        let mut r = request();
        r.set_param("query", "rate(http_requests_total[5m])".to_string());
        let url = r.upstream_url();
        assert!(url.starts_with("http://origin:9090/api/v1/query_range?"));
        assert!(url.contains("rate%28http_requests_total%5B5m%5D%29"));
    }

    #[test]
    fn test_decode_body_gzip() {
        use flate2::write::GzEncoder;
        use std::io::Write;
        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(b"payload").unwrap();
        let compressed = enc.finish().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_ENCODING,
            HeaderValue::from_static("gzip"),
        );
        let out = decode_body(&headers, Bytes::from(compressed)).unwrap();
        assert_eq!(&out[..], b"payload");
    }

    #[tokio::test]
    async fn test_fetch_pool_overload_flag() {
        let pool = FetchPool::new(1, 1);
        assert!(!pool.is_overloaded());
        let _p1 = pool.acquire().await;
        // queue two waiters behind the single permit
        pool.queued.store(2, Ordering::Relaxed);
        assert!(pool.is_overloaded());
    }
}
