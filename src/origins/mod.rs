use std::sync::Arc;

use crate::config::{OriginConfig, PathConfig};
use crate::error::Error;
use crate::proxy::request::ProxyRequest;
use crate::timeseries::{Extent, TimeRangeQuery, Timeseries};

pub mod influxdb;
pub mod prometheus;

/// Per-database adapter the engines drive. A client knows how to read a
/// time range out of a request, fingerprint it, rewrite the upstream
/// query for a delta extent, and translate wire bodies to and from the
/// abstract [`Timeseries`]. It holds no cache reference; the engine owns
/// both client and cache for the duration of a request.
pub trait OriginClient: Send + Sync {
    fn name(&self) -> &str;
    fn origin_type(&self) -> &'static str;
    fn configuration(&self) -> &Arc<OriginConfig>;

    /// The route set this origin type serves, before the user overlay.
    fn default_path_configs(&self) -> Vec<PathConfig>;

    /// Extracts the statement, extent, and step from the request. Returns
    /// `Error::NotTimeRangeQuery` when the request cannot be range-cached,
    /// in which case the frontend falls back to the object engine.
    fn parse_time_range_query(&self, request: &ProxyRequest) -> Result<TimeRangeQuery, Error>;

    /// Deterministic fingerprint for cache keys and lock names.
    fn derive_cache_key(&self, request: &ProxyRequest) -> String;

    /// Rewrites the upstream request's time parameters to cover `extent`.
    fn set_extent(&self, request: &mut ProxyRequest, trq: &TimeRangeQuery, extent: &Extent);

    /// Builds the instant-query request used to fetch the most recent
    /// sample for fast-forward.
    fn fast_forward_request(&self, request: &ProxyRequest) -> Result<ProxyRequest, Error>;

    /// Builds the origin health probe request.
    fn health_request(&self, request: &ProxyRequest) -> ProxyRequest;

    fn unmarshal_timeseries(
        &self,
        body: &[u8],
        trq: &TimeRangeQuery,
    ) -> Result<Box<dyn Timeseries>, Error>;

    /// Decodes an instant (single-sample) body.
    fn unmarshal_instantaneous(
        &self,
        body: &[u8],
        trq: &TimeRangeQuery,
    ) -> Result<Box<dyn Timeseries>, Error>;

    /// Encodes a series for the client wire format.
    fn marshal_timeseries(&self, ts: &dyn Timeseries) -> Result<Vec<u8>, Error>;

    /// Encodes a series for cache storage. The cache format carries the
    /// extent list and step, which the wire format does not.
    fn marshal_for_cache(&self, ts: &dyn Timeseries) -> Result<Vec<u8>, Error>;

    /// Decodes a cache-stored series.
    fn unmarshal_from_cache(&self, body: &[u8]) -> Result<Box<dyn Timeseries>, Error>;
}

/// Instantiates the client for an origin's configured type.
pub fn new_client(name: &str, config: Arc<OriginConfig>) -> Result<Arc<dyn OriginClient>, Error> {
    match config.origin_type.as_str() {
        "prometheus" => Ok(Arc::new(prometheus::PrometheusClient::new(name, config))),
        "influxdb" => Ok(Arc::new(influxdb::InfluxClient::new(name, config))),
        other => Err(Error::Config(format!(
            "origin {}: unknown origin_type {}",
            name, other
        ))),
    }
}

/// Parses a duration expression into nanoseconds: bare numbers are
/// seconds; `ms`, `s`, `m`, `h`, `d`, and `w` suffixes are honored.
pub fn parse_duration_ns(value: &str) -> Result<i64, Error> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Parse("empty duration".to_string()));
    }
    if let Ok(secs) = value.parse::<f64>() {
        return Ok((secs * 1e9) as i64);
    }
    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| Error::Parse(format!("invalid duration: {}", value)))?;
    let (num, unit) = value.split_at(split);
    let num: f64 = num
        .parse()
        .map_err(|_| Error::Parse(format!("invalid duration: {}", value)))?;
    let scale: f64 = match unit {
        "ns" => 1.0,
        "us" | "u" => 1e3,
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60.0 * 1e9,
        "h" => 3600.0 * 1e9,
        "d" => 86_400.0 * 1e9,
        "w" => 604_800.0 * 1e9,
        _ => return Err(Error::Parse(format!("invalid duration unit: {}", unit))),
    };
    Ok((num * scale) as i64)
}

/// Converts fractional seconds to nanoseconds without the precision loss
/// of a single f64 multiply, which matters at current-epoch magnitudes.
pub fn seconds_f64_to_ns(seconds: f64) -> i64 {
    let whole = seconds.trunc() as i64;
    let frac = (seconds.fract() * 1e9).round() as i64;
    whole.saturating_mul(1_000_000_000) + frac
}

/// Parses an epoch timestamp expressed in (possibly fractional) seconds.
pub fn parse_epoch_seconds_ns(value: &str) -> Result<i64, Error> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        return Ok(secs.saturating_mul(1_000_000_000));
    }
    value
        .parse::<f64>()
        .map(seconds_f64_to_ns)
        .map_err(|_| Error::Parse(format!("invalid timestamp: {}", value)))
}
