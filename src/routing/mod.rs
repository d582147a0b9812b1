use bytes::Bytes;
use http_body_util::{BodyExt, combinators::BoxBody};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::locker::Locker;
use crate::cache::{Cache, LookupStatus};
use crate::config::{PathConfig, PathHandler, PathMatchType, TricksterConfig};
use crate::error::Error;
use crate::metrics::ProxyMetrics;
use crate::origins::{OriginClient, new_client};
use crate::proxy::EngineResponse;
use crate::proxy::delta::{FastForwardCache, new_fast_forward_cache};
use crate::proxy::headers::{
    add_response_headers, apply_header_mutations, set_result_header, strip_hop_by_hop,
};
use crate::proxy::object::object_proxy_cache_request;
use crate::proxy::request::{FetchPool, ProxyRequest};

/// Everything needed to service one configured route.
#[derive(Clone)]
struct Route {
    origin_name: String,
    client: Arc<dyn OriginClient>,
    cache: Arc<dyn Cache>,
    path_config: Arc<PathConfig>,
    pool: Arc<FetchPool>,
    ff_cache: FastForwardCache,
    /// Upstream base parts parsed from the origin URL.
    scheme: String,
    authority: String,
    path_prefix: String,
    /// The request-path prefix stripped before building the upstream path.
    strip_prefix: String,
}

/// The frontend routing table: exact paths win, then the longest matching
/// prefix. Built once from config and swapped atomically on reload.
pub struct Router {
    exact: HashMap<String, Route>,
    prefix: Vec<(String, Route)>,
    locker: Arc<Locker>,
    metrics: Arc<ProxyMetrics>,
}

fn parse_origin_url(url: &str) -> Result<(String, String, String), Error> {
    let parsed = url::Url::parse(url).map_err(|e| Error::Config(format!("{}: {}", url, e)))?;
    let scheme = parsed.scheme().to_string();
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Config(format!("origin url missing host: {}", url)))?;
    let authority = match parsed.port() {
        Some(p) => format!("{}:{}", host, p),
        None => host.to_string(),
    };
    let path_prefix = parsed.path().trim_end_matches('/').to_string();
    Ok((scheme, authority, path_prefix))
}

impl Router {
    /// Builds the routing table: each origin's default paths overlaid
    /// with the user's path config, registered under `/<origin-name>`
    /// and, for the default origin, at the bare path as well.
    pub fn from_config(
        cfg: &TricksterConfig,
        caches: &HashMap<String, Arc<dyn Cache>>,
        metrics: Arc<ProxyMetrics>,
        locker: Arc<Locker>,
    ) -> Result<Router, Error> {
        let mut exact = HashMap::new();
        let mut prefix: Vec<(String, Route)> = Vec::new();
        let single_origin = cfg.origins.len() == 1;

        for (name, origin_cfg) in &cfg.origins {
            let origin = Arc::new(origin_cfg.clone());
            let client = new_client(name, Arc::clone(&origin))?;
            let cache = caches
                .get(&origin_cfg.cache_name)
                .ok_or_else(|| {
                    Error::Config(format!("origin {} has no cache", name))
                })?
                .clone();
            let cache_type = cfg
                .caches
                .get(&origin_cfg.cache_name)
                .map(|c| c.cache_type.clone())
                .unwrap_or_default();
            let pool = Arc::new(
                FetchPool::new(origin_cfg.max_concurrent_fetches, origin_cfg.max_queue_depth)
                    .with_observer(crate::cache::CacheObserver::new(
                        &origin_cfg.cache_name,
                        &cache_type,
                        Arc::clone(&metrics),
                    )),
            );
            let ff_cache = new_fast_forward_cache(origin_cfg.fast_forward_ttl_ms);
            let (scheme, authority, path_prefix) = parse_origin_url(&origin_cfg.origin_url)?;

            // user entries overlay client defaults, keyed by path
            let mut paths: Vec<PathConfig> = client.default_path_configs();
            for (path, user_pc) in &origin_cfg.paths {
                let mut pc = user_pc.clone();
                pc.path = path.clone();
                match paths.iter_mut().find(|d| d.path == *path) {
                    Some(existing) => *existing = pc,
                    None => paths.push(pc),
                }
            }

            for pc in paths {
                let make_route = |strip_prefix: String| Route {
                    origin_name: name.clone(),
                    client: Arc::clone(&client),
                    cache: Arc::clone(&cache),
                    path_config: Arc::new(pc.clone()),
                    pool: Arc::clone(&pool),
                    ff_cache: ff_cache.clone(),
                    scheme: scheme.clone(),
                    authority: authority.clone(),
                    path_prefix: path_prefix.clone(),
                    strip_prefix,
                };

                let prefixed_path = format!("/{}{}", name, pc.path);
                match pc.match_type {
                    PathMatchType::Exact => {
                        exact.insert(prefixed_path, make_route(format!("/{}", name)));
                        if origin_cfg.is_default || single_origin {
                            exact.insert(pc.path.clone(), make_route(String::new()));
                        }
                    }
                    PathMatchType::Prefix => {
                        prefix.push((prefixed_path, make_route(format!("/{}", name))));
                        if origin_cfg.is_default || single_origin {
                            prefix.push((pc.path.clone(), make_route(String::new())));
                        }
                    }
                }
            }
        }

        // longest prefix wins
        prefix.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Ok(Router {
            exact,
            prefix,
            locker,
            metrics,
        })
    }

    fn match_route(&self, path: &str) -> Option<&Route> {
        if let Some(route) = self.exact.get(path) {
            return Some(route);
        }
        self.prefix
            .iter()
            .find(|(p, _)| path.starts_with(p.as_str()))
            .map(|(_, r)| r)
    }

    /// Services one frontend request end to end.
    pub async fn handle(
        self: &Arc<Self>,
        req: Request<hyper::body::Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let started = std::time::Instant::now();
        let path = req.uri().path().to_string();
        let method = req.method().to_string();

        let Some(route) = self.match_route(&path).cloned() else {
            return Ok(simple_response(404, Bytes::from_static(b"404 not found\n")));
        };

        if !route.path_config.methods.is_empty()
            && !route.path_config.methods.iter().any(|m| m == &method)
        {
            return Ok(simple_response(
                405,
                Bytes::from_static(b"405 method not allowed\n"),
            ));
        }

        let request = match build_proxy_request(req, &route, &method, &path, peer).await {
            Ok(r) => r,
            Err(e) => return Ok(simple_response(e.http_status(), Bytes::from(format!("{}\n", e)))),
        };

        let (engine_name, mut engine_response) = self.dispatch(&route, &request).await;

        strip_hop_by_hop(&mut engine_response.headers);
        apply_header_mutations(
            &mut engine_response.headers,
            &route.path_config.response_headers,
        );
        add_response_headers(&mut engine_response.headers);
        set_result_header(
            &mut engine_response.headers,
            engine_name,
            engine_response.lookup_status,
            engine_response.fetched.as_ref(),
        );

        let http_status = engine_response.status_code.to_string();
        let cache_status = engine_response.lookup_status.to_string();
        let labels = [
            route.origin_name.as_str(),
            route.client.origin_type(),
            method.as_str(),
            http_status.as_str(),
            route.path_config.path.as_str(),
            cache_status.as_str(),
        ];
        self.metrics
            .proxy_requests_total
            .with_label_values(&labels)
            .inc();
        self.metrics
            .proxy_request_duration
            .with_label_values(&labels)
            .observe(started.elapsed().as_secs_f64());

        let mut builder = Response::builder().status(engine_response.status_code);
        if let Some(headers) = builder.headers_mut() {
            *headers = engine_response.headers;
        }
        Ok(builder
            .body(
                http_body_util::Full::new(engine_response.body)
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap())
    }

    async fn dispatch(
        self: &Arc<Self>,
        route: &Route,
        request: &ProxyRequest,
    ) -> (&'static str, EngineResponse) {
        match route.path_config.handler {
            PathHandler::DeltaProxyCache => {
                match route.client.parse_time_range_query(request) {
                    Ok(trq) => (
                        "DeltaProxyCache",
                        crate::proxy::delta::delta_proxy_cache_request(
                            request,
                            trq,
                            &route.client,
                            &route.cache,
                            &self.locker,
                            &route.pool,
                            &route.ff_cache,
                        )
                        .await,
                    ),
                    // not range-cacheable: fall back to plain object caching
                    Err(Error::NotTimeRangeQuery) => (
                        "ObjectProxyCache",
                        object_proxy_cache_request(
                            request,
                            &route.client,
                            &route.cache,
                            &self.locker,
                        )
                        .await,
                    ),
                    Err(e) => ("DeltaProxyCache", EngineResponse::from_error(&e)),
                }
            }
            PathHandler::ProxyCache => (
                "ObjectProxyCache",
                object_proxy_cache_request(request, &route.client, &route.cache, &self.locker)
                    .await,
            ),
            PathHandler::Proxy => ("HTTPProxy", proxy_request_passthrough(request).await),
            PathHandler::LocalResponse => {
                let pc = &route.path_config;
                let body = pc.response_body.clone().unwrap_or_default();
                (
                    "LocalResponse",
                    EngineResponse::new(pc.response_code, LookupStatus::ProxyOnly)
                        .with_body(Bytes::from(body)),
                )
            }
            PathHandler::Health => {
                let probe = route.client.health_request(request);
                ("HealthHandler", proxy_request_passthrough(&probe).await)
            }
        }
    }
}

/// Cache-bypassing passthrough used by `proxy` and `health` routes.
async fn proxy_request_passthrough(request: &ProxyRequest) -> EngineResponse {
    match request.fetch().await {
        Ok(response) => EngineResponse::new(response.status, LookupStatus::ProxyOnly)
            .with_headers(response.headers)
            .with_body(response.body),
        Err(e) => EngineResponse::from_error(&e),
    }
}

/// Translates the hyper request into the engine-facing [`ProxyRequest`]:
/// query parsed, form bodies folded into the parameter set, hop-by-hop
/// headers stripped, route request headers applied.
async fn build_proxy_request(
    req: Request<hyper::body::Incoming>,
    route: &Route,
    method: &str,
    path: &str,
    peer: SocketAddr,
) -> Result<ProxyRequest, Error> {
    let mut params: Vec<(String, String)> = req
        .uri()
        .query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut headers = req.headers().clone();
    let is_form = headers
        .get(hyper::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::Parse(format!("request body: {}", e)))?
        .to_bytes();

    if is_form && !body.is_empty() {
        params.extend(
            url::form_urlencoded::parse(&body)
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
    }

    strip_hop_by_hop(&mut headers);
    apply_header_mutations(&mut headers, &route.path_config.request_headers);

    let upstream_path = path
        .strip_prefix(route.strip_prefix.as_str())
        .unwrap_or(path);
    Ok(ProxyRequest {
        origin_name: route.origin_name.clone(),
        origin: Arc::clone(route.client.configuration()),
        path_config: Arc::clone(&route.path_config),
        method: method.to_string(),
        scheme: route.scheme.clone(),
        authority: route.authority.clone(),
        path: format!("{}{}", route.path_prefix, upstream_path),
        template_params: params.clone(),
        params,
        headers,
        body,
        remote_addr: peer.ip().to_string(),
    })
}

fn simple_response(status: u16, body: Bytes) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .body(
            http_body_util::Full::new(body)
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap()
}

/// Binds the frontend listener and runs the accept loop until shutdown.
/// Returns an error only when the listener cannot bind.
pub async fn start_frontend(
    bind_addr: String,
    router: Arc<arc_swap::ArcSwap<Router>>,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|_| Error::Config(format!("invalid frontend bind address: {}", bind_addr)))?;
    let listener = TcpListener::bind(&addr).await.map_err(Error::Io)?;
    info!("Frontend proxy listening on {}", addr);
    serve_frontend(listener, router, tls_acceptor, shutdown).await;
    Ok(())
}

/// The accept loop proper, on an already-bound listener.
pub async fn serve_frontend(
    listener: TcpListener,
    router: Arc<arc_swap::ArcSwap<Router>>,
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok(s) => s,
                    Err(e) => {
                        error!("Accept error: {}", e);
                        continue;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("Frontend shutting down gracefully — no new connections accepted.");
                break;
            }
        };

        let router = Arc::clone(&router);
        let tls_acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            let svc = service_fn(move |req| {
                let router = router.load_full();
                async move { router.handle(req, peer).await }
            });
            match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let io = TokioIo::new(tls_stream);
                        if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                            debug!("Error serving TLS connection: {:?}", e);
                        }
                    }
                    Err(e) => debug!("TLS handshake failed: {}", e),
                },
                None => {
                    let io = TokioIo::new(stream);
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        debug!("Error serving connection: {:?}", e);
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OriginConfig;

    fn test_config() -> TricksterConfig {
        let mut cfg = TricksterConfig::default();
        let mut origin = OriginConfig::default();
        origin.origin_url = "http://prometheus:9090".to_string();
        origin.is_default = true;
        cfg.origins.insert("prom".to_string(), origin);
        cfg.caches
            .insert("default".to_string(), crate::config::CachingConfig::default());
        cfg
    }

    async fn test_router(cfg: &TricksterConfig) -> Router {
        let metrics = Arc::new(ProxyMetrics::new());
        let caches = crate::cache::load_caches_from_config(
            cfg,
            Arc::clone(&metrics),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        Router::from_config(cfg, &caches, metrics, Locker::new()).unwrap()
    }

    #[test]
    fn test_parse_origin_url() {
        let (scheme, authority, prefix) =
            parse_origin_url("http://prometheus:9090").unwrap();
        assert_eq!(scheme, "http");
        assert_eq!(authority, "prometheus:9090");
        assert_eq!(prefix, "");

        let (_, authority, prefix) =
            parse_origin_url("https://metrics.example.com/prom/").unwrap();
        assert_eq!(authority, "metrics.example.com");
        assert_eq!(prefix, "/prom");

        assert!(parse_origin_url("not a url").is_err());
    }

    #[tokio::test]
    async fn test_route_matching() {
        let cfg = test_config();
        let router = test_router(&cfg).await;

        // default origin gets bare paths and prefixed paths
        let r = router.match_route("/api/v1/query_range").unwrap();
        assert_eq!(r.path_config.handler, PathHandler::DeltaProxyCache);
        let r = router.match_route("/prom/api/v1/query_range").unwrap();
        assert_eq!(r.path_config.handler, PathHandler::DeltaProxyCache);

        // prefix match falls back to the catch-all proxy
        let r = router.match_route("/graph").unwrap();
        assert_eq!(r.path_config.handler, PathHandler::Proxy);

        // longest prefix wins over the catch-all
        let r = router.match_route("/api/v1/labels").unwrap();
        assert_eq!(r.path_config.handler, PathHandler::ProxyCache);
    }

    #[tokio::test]
    async fn test_user_path_overlay_replaces_default() {
        let mut cfg = test_config();
        let mut pc = PathConfig::default();
        pc.handler = PathHandler::LocalResponse;
        pc.response_code = 418;
        cfg.origins
            .get_mut("prom")
            .unwrap()
            .paths
            .insert("/api/v1/query_range".to_string(), pc);
        let router = test_router(&cfg).await;
        let r = router.match_route("/api/v1/query_range").unwrap();
        assert_eq!(r.path_config.handler, PathHandler::LocalResponse);
        assert_eq!(r.path_config.response_code, 418);
    }

    #[tokio::test]
    async fn test_non_default_origin_requires_prefix() {
        let mut cfg = test_config();
        cfg.origins.get_mut("prom").unwrap().is_default = false;
        let mut second = OriginConfig::default();
        second.origin_url = "http://other:9090".to_string();
        cfg.origins.insert("other".to_string(), second);

        let router = test_router(&cfg).await;
        assert!(router.match_route("/prom/api/v1/query_range").is_some());
        assert!(router.match_route("/other/api/v1/query_range").is_some());
        let bare = router.match_route("/api/v1/query_range");
        assert!(bare.is_none());
    }
}
