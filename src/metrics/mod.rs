use actix_web::{App, HttpResponse, HttpServer, Responder, get, web};
use prometheus::{
    Encoder, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use tracing::info;

/// Global metrics registry shared across the proxy engines, cache
/// backends, and the metrics listener.
#[derive(Clone)]
pub struct ProxyMetrics {
    pub registry: Registry,
    /// Total frontend requests, labeled by origin, method, status, path,
    /// and cache lookup status.
    pub proxy_requests_total: IntCounterVec,
    /// Frontend request duration in seconds.
    pub proxy_request_duration: HistogramVec,
    /// Current object count per cache.
    pub cache_objects: GaugeVec,
    /// Current byte count per cache.
    pub cache_bytes: GaugeVec,
    /// Cache operations (get/set/del), by status.
    pub cache_object_operations_total: IntCounterVec,
    /// Bytes moved by cache operations, by status.
    pub cache_byte_operations_total: IntCounterVec,
    /// Cache lifecycle events (evictions, expirations, errors).
    pub cache_events_total: IntCounterVec,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let proxy_requests_total = IntCounterVec::new(
            Opts::new(
                "trickster_proxy_requests_total",
                "Total frontend requests processed",
            ),
            &[
                "origin_name",
                "origin_type",
                "method",
                "http_status",
                "path",
                "cache_status",
            ],
        )
        .unwrap();

        let proxy_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "trickster_proxy_request_duration_seconds",
                "Frontend request latency in seconds",
            )
            .buckets(vec![
                0.005, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &[
                "origin_name",
                "origin_type",
                "method",
                "http_status",
                "path",
                "cache_status",
            ],
        )
        .unwrap();

        let cache_objects = GaugeVec::new(
            Opts::new("trickster_cache_objects", "Objects resident in the cache"),
            &["cache", "type"],
        )
        .unwrap();

        let cache_bytes = GaugeVec::new(
            Opts::new("trickster_cache_bytes", "Bytes resident in the cache"),
            &["cache", "type"],
        )
        .unwrap();

        let cache_object_operations_total = IntCounterVec::new(
            Opts::new(
                "trickster_cache_object_operations_total",
                "Cache object operations by type and status",
            ),
            &["cache", "type", "operation", "status"],
        )
        .unwrap();

        let cache_byte_operations_total = IntCounterVec::new(
            Opts::new(
                "trickster_cache_byte_operations_total",
                "Bytes handled by cache operations, by type and status",
            ),
            &["cache", "type", "operation", "status"],
        )
        .unwrap();

        let cache_events_total = IntCounterVec::new(
            Opts::new(
                "trickster_cache_events_total",
                "Cache lifecycle events by reason",
            ),
            &["cache", "type", "event", "reason"],
        )
        .unwrap();

        registry
            .register(Box::new(proxy_requests_total.clone()))
            .unwrap();
        registry
            .register(Box::new(proxy_request_duration.clone()))
            .unwrap();
        registry.register(Box::new(cache_objects.clone())).unwrap();
        registry.register(Box::new(cache_bytes.clone())).unwrap();
        registry
            .register(Box::new(cache_object_operations_total.clone()))
            .unwrap();
        registry
            .register(Box::new(cache_byte_operations_total.clone()))
            .unwrap();
        registry
            .register(Box::new(cache_events_total.clone()))
            .unwrap();

        Self {
            registry,
            proxy_requests_total,
            proxy_request_duration,
            cache_objects,
            cache_bytes,
            cache_object_operations_total,
            cache_byte_operations_total,
            cache_events_total,
        }
    }

    /// Encodes all registered metrics into Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

#[get("/metrics")]
async fn metrics_endpoint(metrics_data: web::Data<Arc<ProxyMetrics>>) -> impl Responder {
    let body = metrics_data.encode();
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(body)
}

/// Runs the metrics/health listener until process exit.
pub async fn start_metrics_server(bind_addr: String, metrics: Arc<ProxyMetrics>) {
    info!("Metrics endpoint listening on http://{}", bind_addr);

    let metrics_data = web::Data::new(metrics);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(metrics_data.clone())
            .service(health)
            .service(metrics_endpoint)
    })
    .bind(&bind_addr)
    .expect("Invalid metrics bind address")
    .run();

    if let Err(e) = server.await {
        tracing::error!("Metrics server error: {}", e);
    }
}
