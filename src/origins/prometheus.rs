use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::config::{OriginConfig, PathConfig, PathHandler, PathMatchType};
use crate::error::Error;
use crate::origins::{OriginClient, parse_duration_ns, parse_epoch_seconds_ns};
use crate::proxy::key;
use crate::proxy::request::ProxyRequest;
use crate::timeseries::{
    ceil_to_step, Epoch, Extent, ExtentList, TimeRangeQuery, Timeseries,
};

const PARAM_QUERY: &str = "query";
const PARAM_START: &str = "start";
const PARAM_END: &str = "end";
const PARAM_STEP: &str = "step";
const PARAM_TIME: &str = "time";

const EP_QUERY_RANGE: &str = "/api/v1/query_range";
const EP_QUERY: &str = "/api/v1/query";

/// One sample. Prometheus serializes values as strings on the wire and we
/// keep them that way; the proxy never does arithmetic on sample values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub epoch: Epoch,
    pub value: String,
}

/// One labeled series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub metric: BTreeMap<String, String>,
    pub points: Vec<Point>,
}

/// The Prometheus-shaped [`Timeseries`]. The cache representation is this
/// struct serialized directly, which carries the extent list and step the
/// wire format has no room for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrometheusTimeseries {
    pub series: Vec<Series>,
    pub extents: ExtentList,
    pub step: i64,
}

impl Timeseries for PrometheusTimeseries {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn clone_box(&self) -> Box<dyn Timeseries> {
        Box::new(self.clone())
    }

    fn extents(&self) -> ExtentList {
        self.extents.clone()
    }

    fn set_extents(&mut self, extents: ExtentList) {
        self.extents = extents;
    }

    fn merge(&mut self, truesort: bool, other: Box<dyn Timeseries>) {
        let Some(other) = other.as_any().downcast_ref::<PrometheusTimeseries>() else {
            return;
        };
        for os in &other.series {
            match self.series.iter_mut().find(|s| s.metric == os.metric) {
                Some(s) => {
                    let mut merged: BTreeMap<Epoch, String> =
                        s.points.drain(..).map(|p| (p.epoch, p.value)).collect();
                    // points from `other` override on equal epoch
                    for p in &os.points {
                        merged.insert(p.epoch, p.value.clone());
                    }
                    s.points = merged
                        .into_iter()
                        .map(|(epoch, value)| Point { epoch, value })
                        .collect();
                }
                None => self.series.push(os.clone()),
            }
        }
        self.extents = self.extents.union(&other.extents);
        if truesort {
            self.sort();
        }
    }

    fn crop_to_range(&mut self, e: Extent) {
        for s in &mut self.series {
            s.points.retain(|p| e.contains(p.epoch));
        }
        self.series.retain(|s| !s.points.is_empty());
        self.extents = self.extents.crop(e);
    }

    fn crop_to_size(&mut self, n: usize, at: Epoch) {
        let epochs: BTreeSet<Epoch> = self
            .series
            .iter()
            .flat_map(|s| s.points.iter().map(|p| p.epoch))
            .filter(|&e| e <= at)
            .collect();
        let keep: BTreeSet<Epoch> = epochs.iter().rev().take(n).copied().collect();
        for s in &mut self.series {
            s.points.retain(|p| keep.contains(&p.epoch));
        }
        self.series.retain(|s| !s.points.is_empty());
        match keep.first() {
            Some(&min) => {
                let end = if self.step > 0 {
                    ceil_to_step(at, self.step).max(min)
                } else {
                    at.max(min)
                };
                self.extents = self.extents.crop(Extent::new(min, end));
            }
            None => self.extents = ExtentList::new(),
        }
    }

    fn sort(&mut self) {
        for s in &mut self.series {
            let dedup: BTreeMap<Epoch, String> =
                s.points.drain(..).map(|p| (p.epoch, p.value)).collect();
            s.points = dedup
                .into_iter()
                .map(|(epoch, value)| Point { epoch, value })
                .collect();
        }
    }

    fn size(&self) -> usize {
        self.series
            .iter()
            .map(|s| {
                let labels: usize = s.metric.iter().map(|(k, v)| k.len() + v.len()).sum();
                let points: usize = s.points.iter().map(|p| 16 + p.value.len()).sum();
                labels + points
            })
            .sum()
    }

    fn series_count(&self) -> usize {
        self.series.len()
    }

    fn value_count(&self) -> usize {
        self.series.iter().map(|s| s.points.len()).sum()
    }

    fn timestamp_count(&self) -> usize {
        self.series
            .iter()
            .flat_map(|s| s.points.iter().map(|p| p.epoch))
            .collect::<BTreeSet<_>>()
            .len()
    }

    fn step(&self) -> i64 {
        self.step
    }

    fn set_step(&mut self, step: i64) {
        self.step = step;
    }
}

// ── Wire format ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct WireDocument {
    status: String,
    data: WireData,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Vec<WireResult>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireResult {
    metric: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    values: Vec<(f64, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<(f64, String)>,
}

fn seconds_to_ns(seconds: f64) -> Epoch {
    crate::origins::seconds_f64_to_ns(seconds)
}

/// Exact for whole seconds; sub-second epochs keep f64 precision, which
/// is ample at sub-second scale.
fn ns_to_seconds_f64(ns: Epoch) -> f64 {
    (ns / 1_000_000_000) as f64 + (ns % 1_000_000_000) as f64 / 1e9
}

fn ns_to_seconds_string(ns: Epoch) -> String {
    if ns % 1_000_000_000 == 0 {
        (ns / 1_000_000_000).to_string()
    } else {
        format!("{}", ns_to_seconds_f64(ns))
    }
}

/// Decodes a Prometheus matrix or vector body into a timeseries stamped
/// with the query's extent and step.
pub fn unmarshal_timeseries(
    body: &[u8],
    trq: &TimeRangeQuery,
) -> Result<PrometheusTimeseries, Error> {
    let doc: WireDocument =
        serde_json::from_slice(body).map_err(|e| Error::Unmarshal(e.to_string()))?;
    let mut ts = PrometheusTimeseries {
        series: Vec::new(),
        extents: ExtentList::single(trq.extent),
        step: trq.step,
    };
    for r in doc.data.result {
        let mut points: Vec<Point> = match doc.data.result_type.as_str() {
            "matrix" => r
                .values
                .iter()
                .map(|(sec, value)| Point {
                    epoch: seconds_to_ns(*sec),
                    value: value.clone(),
                })
                .collect(),
            "vector" => match &r.value {
                Some((sec, value)) => {
                    let epoch = seconds_to_ns(*sec);
                    ts.extents =
                        ExtentList::single(Extent::new(epoch, epoch + trq.step.max(1)));
                    vec![Point {
                        epoch,
                        value: value.clone(),
                    }]
                }
                None => Vec::new(),
            },
            other => {
                return Err(Error::Unmarshal(format!(
                    "unsupported resultType: {}",
                    other
                )));
            }
        };
        points.sort_by_key(|p| p.epoch);
        ts.series.push(Series {
            metric: r.metric,
            points,
        });
    }
    Ok(ts)
}

/// Encodes a timeseries as a Prometheus matrix response body.
pub fn marshal_timeseries(ts: &PrometheusTimeseries) -> Result<Vec<u8>, Error> {
    let doc = WireDocument {
        status: "success".to_string(),
        data: WireData {
            result_type: "matrix".to_string(),
            result: ts
                .series
                .iter()
                .filter(|s| !s.points.is_empty())
                .map(|s| WireResult {
                    metric: s.metric.clone(),
                    values: s
                        .points
                        .iter()
                        .map(|p| (ns_to_seconds_f64(p.epoch), p.value.clone()))
                        .collect(),
                    value: None,
                })
                .collect(),
        },
    };
    serde_json::to_vec(&doc).map_err(|e| Error::Unmarshal(e.to_string()))
}

// ── Client ───────────────────────────────────────────────────────────────

/// Origin client for Prometheus HTTP API upstreams.
pub struct PrometheusClient {
    name: String,
    config: Arc<OriginConfig>,
}

impl PrometheusClient {
    pub fn new(name: &str, config: Arc<OriginConfig>) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }
}

impl OriginClient for PrometheusClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn origin_type(&self) -> &'static str {
        "prometheus"
    }

    fn configuration(&self) -> &Arc<OriginConfig> {
        &self.config
    }

    fn default_path_configs(&self) -> Vec<PathConfig> {
        vec![
            PathConfig {
                path: EP_QUERY_RANGE.to_string(),
                handler: PathHandler::DeltaProxyCache,
                methods: vec!["GET".to_string(), "POST".to_string()],
                match_type: PathMatchType::Exact,
                cache_key_params: vec![PARAM_QUERY.to_string(), PARAM_STEP.to_string()],
                ..Default::default()
            },
            PathConfig {
                path: EP_QUERY.to_string(),
                handler: PathHandler::ProxyCache,
                methods: vec!["GET".to_string(), "POST".to_string()],
                match_type: PathMatchType::Exact,
                cache_key_params: vec![PARAM_QUERY.to_string(), PARAM_TIME.to_string()],
                default_ttl_ms: 15_000,
                ..Default::default()
            },
            PathConfig {
                path: "/api/v1/".to_string(),
                handler: PathHandler::ProxyCache,
                match_type: PathMatchType::Prefix,
                default_ttl_ms: 30_000,
                ..Default::default()
            },
            PathConfig {
                path: "/health".to_string(),
                handler: PathHandler::Health,
                match_type: PathMatchType::Exact,
                ..Default::default()
            },
            PathConfig {
                path: "/".to_string(),
                handler: PathHandler::Proxy,
                match_type: PathMatchType::Prefix,
                ..Default::default()
            },
        ]
    }

    fn parse_time_range_query(&self, request: &ProxyRequest) -> Result<TimeRangeQuery, Error> {
        if !request.path.ends_with(EP_QUERY_RANGE) {
            return Err(Error::NotTimeRangeQuery);
        }
        let statement = request
            .param(PARAM_QUERY)
            .ok_or_else(|| Error::MissingUrlParam(PARAM_QUERY.to_string()))?
            .to_string();
        let start = parse_epoch_seconds_ns(
            request
                .param(PARAM_START)
                .ok_or_else(|| Error::MissingUrlParam(PARAM_START.to_string()))?,
        )?;
        let end = parse_epoch_seconds_ns(
            request
                .param(PARAM_END)
                .ok_or_else(|| Error::MissingUrlParam(PARAM_END.to_string()))?,
        )?;
        let step = parse_duration_ns(
            request
                .param(PARAM_STEP)
                .ok_or_else(|| Error::MissingUrlParam(PARAM_STEP.to_string()))?,
        )?;
        if step <= 0 || end < start {
            return Err(Error::Parse("invalid time range".to_string()));
        }
        Ok(TimeRangeQuery {
            statement,
            extent: Extent::new(start, end),
            step,
            tags: BTreeMap::new(),
        })
    }

    fn derive_cache_key(&self, request: &ProxyRequest) -> String {
        key::derive_cache_key(
            &self.name,
            &request.path_config,
            &request.method,
            &request.path,
            &request.template_params,
            &request.headers,
        )
    }

    fn set_extent(&self, request: &mut ProxyRequest, _trq: &TimeRangeQuery, extent: &Extent) {
        request.set_param(PARAM_START, ns_to_seconds_string(extent.start));
        request.set_param(PARAM_END, ns_to_seconds_string(extent.end));
    }

    fn fast_forward_request(&self, request: &ProxyRequest) -> Result<ProxyRequest, Error> {
        let mut ff = request.clone();
        ff.path = request.path.replace(EP_QUERY_RANGE, EP_QUERY);
        let statement = request
            .template_param(PARAM_QUERY)
            .ok_or_else(|| Error::MissingUrlParam(PARAM_QUERY.to_string()))?
            .to_string();
        ff.params = vec![(PARAM_QUERY.to_string(), statement)];
        ff.template_params = ff.params.clone();
        Ok(ff)
    }

    fn health_request(&self, request: &ProxyRequest) -> ProxyRequest {
        let mut probe = request.clone();
        let base = request
            .path
            .strip_suffix("/health")
            .unwrap_or(&request.path);
        probe.path = format!("{}{}", base, EP_QUERY);
        probe.method = "GET".to_string();
        probe.params = vec![(PARAM_QUERY.to_string(), "up".to_string())];
        probe.template_params = probe.params.clone();
        probe
    }

    fn unmarshal_timeseries(
        &self,
        body: &[u8],
        trq: &TimeRangeQuery,
    ) -> Result<Box<dyn Timeseries>, Error> {
        Ok(Box::new(unmarshal_timeseries(body, trq)?))
    }

    fn unmarshal_instantaneous(
        &self,
        body: &[u8],
        trq: &TimeRangeQuery,
    ) -> Result<Box<dyn Timeseries>, Error> {
        Ok(Box::new(unmarshal_timeseries(body, trq)?))
    }

    fn marshal_timeseries(&self, ts: &dyn Timeseries) -> Result<Vec<u8>, Error> {
        let ts = ts
            .as_any()
            .downcast_ref::<PrometheusTimeseries>()
            .ok_or_else(|| Error::Unmarshal("not a prometheus timeseries".to_string()))?;
        marshal_timeseries(ts)
    }

    fn marshal_for_cache(&self, ts: &dyn Timeseries) -> Result<Vec<u8>, Error> {
        let ts = ts
            .as_any()
            .downcast_ref::<PrometheusTimeseries>()
            .ok_or_else(|| Error::Unmarshal("not a prometheus timeseries".to_string()))?;
        serde_json::to_vec(ts).map_err(|e| Error::Unmarshal(e.to_string()))
    }

    fn unmarshal_from_cache(&self, body: &[u8]) -> Result<Box<dyn Timeseries>, Error> {
        let ts: PrometheusTimeseries =
            serde_json::from_slice(body).map_err(|e| Error::Unmarshal(e.to_string()))?;
        Ok(Box::new(ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: i64 = 1_000_000_000;

    fn ts_with(points: &[(i64, &str)], extent: (i64, i64), step: i64) -> PrometheusTimeseries {
        let mut metric = BTreeMap::new();
        metric.insert("__name__".to_string(), "up".to_string());
        PrometheusTimeseries {
            series: vec![Series {
                metric,
                points: points
                    .iter()
                    .map(|(e, v)| Point {
                        epoch: *e,
                        value: v.to_string(),
                    })
                    .collect(),
            }],
            extents: ExtentList::single(Extent::new(extent.0, extent.1)),
            step,
        }
    }

    fn trq(start: i64, end: i64, step: i64) -> TimeRangeQuery {
        TimeRangeQuery {
            statement: "up".to_string(),
            extent: Extent::new(start, end),
            step,
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn test_unmarshal_matrix() {
        let body = br#"{"status":"success","data":{"resultType":"matrix","result":[
            {"metric":{"__name__":"up","job":"api"},"values":[[100,"1"],[110,"1"],[120,"0"]]}
        ]}}"#;
        let ts = unmarshal_timeseries(body, &trq(100 * SEC, 130 * SEC, 10 * SEC)).unwrap();
        assert_eq!(ts.series_count(), 1);
        assert_eq!(ts.value_count(), 3);
        assert_eq!(ts.series[0].points[0].epoch, 100 * SEC);
        assert_eq!(ts.extents.0, vec![Extent::new(100 * SEC, 130 * SEC)]);
    }

    #[test]
    fn test_unmarshal_vector() {
        let body = br#"{"status":"success","data":{"resultType":"vector","result":[
            {"metric":{"__name__":"up"},"value":[200,"1"]}
        ]}}"#;
        let ts = unmarshal_timeseries(body, &trq(0, 0, 10 * SEC)).unwrap();
        assert_eq!(ts.value_count(), 1);
        assert_eq!(ts.series[0].points[0].epoch, 200 * SEC);
        assert!(!ts.extents.is_empty());
    }

    #[test]
    fn test_unmarshal_garbage_fails() {
        assert!(unmarshal_timeseries(b"not json", &trq(0, 100, 10)).is_err());
    }

    #[test]
    fn test_wire_round_trip() {
        let ts = ts_with(&[(100 * SEC, "1"), (110 * SEC, "2")], (100 * SEC, 120 * SEC), 10 * SEC);
        let body = marshal_timeseries(&ts).unwrap();
        let back = unmarshal_timeseries(&body, &trq(100 * SEC, 120 * SEC, 10 * SEC)).unwrap();
        assert_eq!(back.series[0].points, ts.series[0].points);
    }

    #[test]
    fn test_merge_other_overrides_on_equal_epoch() {
        let mut a = ts_with(&[(100, "old"), (110, "old")], (100, 120), 10);
        let b = ts_with(&[(110, "new"), (120, "new")], (110, 130), 10);
        a.merge(true, Box::new(b));
        let values: Vec<&str> = a.series[0].points.iter().map(|p| p.value.as_str()).collect();
        assert_eq!(values, vec!["old", "new", "new"]);
        assert_eq!(a.extents.0, vec![Extent::new(100, 130)]);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut a = ts_with(&[(100, "1")], (100, 110), 10);
        let b = ts_with(&[(110, "2")], (110, 120), 10);
        a.merge(true, Box::new(b.clone()));
        let once = a.clone();
        a.merge(true, Box::new(b));
        assert_eq!(a, once);
    }

    #[test]
    fn test_merge_new_series_appended() {
        let mut a = ts_with(&[(100, "1")], (100, 110), 10);
        let mut other_metric = BTreeMap::new();
        other_metric.insert("__name__".to_string(), "down".to_string());
        let b = PrometheusTimeseries {
            series: vec![Series {
                metric: other_metric,
                points: vec![Point {
                    epoch: 100,
                    value: "0".to_string(),
                }],
            }],
            extents: ExtentList::single(Extent::new(100, 110)),
            step: 10,
        };
        a.merge(true, Box::new(b));
        assert_eq!(a.series_count(), 2);
    }

    #[test]
    fn test_crop_to_range() {
        let mut ts = ts_with(&[(100, "1"), (110, "1"), (120, "1")], (100, 130), 10);
        ts.crop_to_range(Extent::new(110, 130));
        assert_eq!(ts.value_count(), 2);
        assert_eq!(ts.extents.0, vec![Extent::new(110, 130)]);
        // half-open: a point exactly at `end` is outside
        let mut ts = ts_with(&[(100, "1"), (110, "1")], (100, 120), 10);
        ts.crop_to_range(Extent::new(100, 110));
        assert_eq!(ts.value_count(), 1);
    }

    #[test]
    fn test_crop_to_size_keeps_most_recent() {
        let mut ts = ts_with(&[(100, "1"), (110, "2"), (120, "3"), (130, "4")], (100, 140), 10);
        ts.crop_to_size(2, 140);
        let epochs: Vec<i64> = ts.series[0].points.iter().map(|p| p.epoch).collect();
        assert_eq!(epochs, vec![120, 130]);
        assert_eq!(ts.extents.0[0].start, 120);
    }

    #[test]
    fn test_crop_to_size_respects_at() {
        let mut ts = ts_with(&[(100, "1"), (110, "2"), (120, "3")], (100, 130), 10);
        // points beyond `at` are not eligible
        ts.crop_to_size(2, 115);
        let epochs: Vec<i64> = ts.series[0].points.iter().map(|p| p.epoch).collect();
        assert_eq!(epochs, vec![100, 110]);
    }

    #[test]
    fn test_timestamp_count_distinct_across_series() {
        let mut ts = ts_with(&[(100, "1"), (110, "1")], (100, 120), 10);
        let mut metric = BTreeMap::new();
        metric.insert("job".to_string(), "other".to_string());
        ts.series.push(Series {
            metric,
            points: vec![
                Point {
                    epoch: 110,
                    value: "2".to_string(),
                },
                Point {
                    epoch: 120,
                    value: "2".to_string(),
                },
            ],
        });
        assert_eq!(ts.timestamp_count(), 3);
        assert_eq!(ts.value_count(), 4);
    }

    #[test]
    fn test_parse_time_range_query() {
        let client = PrometheusClient::new("default", Arc::new(OriginConfig::default()));
        let mut request = crate::proxy::request::ProxyRequest {
            origin_name: "default".to_string(),
            origin: Arc::new(OriginConfig::default()),
            path_config: Arc::new(PathConfig::default()),
            method: "GET".to_string(),
            scheme: "http".to_string(),
            authority: "prom:9090".to_string(),
            path: EP_QUERY_RANGE.to_string(),
            params: vec![
                (PARAM_QUERY.to_string(), "up".to_string()),
                (PARAM_START.to_string(), "100".to_string()),
                (PARAM_END.to_string(), "200".to_string()),
                (PARAM_STEP.to_string(), "10".to_string()),
            ],
            template_params: Vec::new(),
            headers: hyper::header::HeaderMap::new(),
            body: bytes::Bytes::new(),
            remote_addr: String::new(),
        };
        let trq = client.parse_time_range_query(&request).unwrap();
        assert_eq!(trq.statement, "up");
        assert_eq!(trq.extent, Extent::new(100 * SEC, 200 * SEC));
        assert_eq!(trq.step, 10 * SEC);

        request.remove_param(PARAM_STEP);
        assert!(matches!(
            client.parse_time_range_query(&request),
            Err(Error::MissingUrlParam(_))
        ));
    }

    #[test]
    fn test_set_extent_rewrites_params() {
        let client = PrometheusClient::new("default", Arc::new(OriginConfig::default()));
        let mut request = crate::proxy::request::ProxyRequest {
            origin_name: "default".to_string(),
            origin: Arc::new(OriginConfig::default()),
            path_config: Arc::new(PathConfig::default()),
            method: "GET".to_string(),
            scheme: "http".to_string(),
            authority: "prom:9090".to_string(),
            path: EP_QUERY_RANGE.to_string(),
            params: vec![
                (PARAM_QUERY.to_string(), "up".to_string()),
                (PARAM_START.to_string(), "100".to_string()),
                (PARAM_END.to_string(), "200".to_string()),
                (PARAM_STEP.to_string(), "10".to_string()),
            ],
            template_params: Vec::new(),
            headers: hyper::header::HeaderMap::new(),
            body: bytes::Bytes::new(),
            remote_addr: String::new(),
        };
        let trq = client.parse_time_range_query(&request).unwrap();
        client.set_extent(&mut request, &trq, &Extent::new(150 * SEC, 180 * SEC));
        assert_eq!(request.param(PARAM_START), Some("150"));
        assert_eq!(request.param(PARAM_END), Some("180"));
    }
}
