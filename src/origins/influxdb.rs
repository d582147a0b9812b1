use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::OnceLock;

use crate::cache::index::now_ns;
use crate::config::{OriginConfig, PathConfig, PathHandler, PathMatchType};
use crate::error::Error;
use crate::origins::{OriginClient, parse_duration_ns};
use crate::proxy::key;
use crate::proxy::request::ProxyRequest;
use crate::timeseries::{Epoch, Extent, ExtentList, TimeRangeQuery, Timeseries};

const PARAM_Q: &str = "q";
const PARAM_DB: &str = "db";
const PARAM_EPOCH: &str = "epoch";

/// Placeholder substituted for the query's time predicate so that
/// requests differing only in range normalize to the same statement.
const TIME_TOKEN: &str = "<$TIME_RANGE$>";

fn re_range() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)time\s*(>=|>)\s*(now\(\)\s*-\s*(?P<rel>\d+[a-z]+)|(?P<abs>\d+)(?P<absunit>ms|ns|u|s)?)(\s+and\s+time\s*(<=|<)\s*((?P<abse>\d+)(?P<abseunit>ms|ns|u|s)?|now\(\)))?",
        )
        .unwrap()
    })
}

fn re_step() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)group\s+by\s+.*?time\((?P<step>\d+[a-z]*)\)").unwrap())
}

fn ts_unit_to_ns(value: i64, unit: Option<&str>) -> Epoch {
    match unit {
        Some("ns") => value,
        Some("u") => value * 1_000,
        Some("ms") | None => value * 1_000_000,
        Some("s") => value * 1_000_000_000,
        _ => value * 1_000_000,
    }
}

/// One row of an InfluxDB series: the time column followed by the
/// remaining field values, untyped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub epoch: Epoch,
    pub fields: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfluxSeries {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

/// The InfluxDB-shaped [`Timeseries`]. Cache representation is this
/// struct serialized directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfluxTimeseries {
    pub series: Vec<InfluxSeries>,
    pub extents: ExtentList,
    pub step: i64,
}

impl InfluxTimeseries {
    fn series_key(s: &InfluxSeries) -> (String, BTreeMap<String, String>) {
        (s.name.clone(), s.tags.clone())
    }
}

impl Timeseries for InfluxTimeseries {
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
        let Some(other) = other.as_any().downcast_ref::<InfluxTimeseries>() else {
            return;
        };
        for os in &other.series {
            let okey = Self::series_key(os);
            match self
                .series
                .iter_mut()
                .find(|s| Self::series_key(s) == okey)
            {
                Some(s) => {
                    let mut merged: BTreeMap<Epoch, Vec<Value>> =
                        s.rows.drain(..).map(|r| (r.epoch, r.fields)).collect();
                    for r in &os.rows {
                        merged.insert(r.epoch, r.fields.clone());
                    }
                    s.rows = merged
                        .into_iter()
                        .map(|(epoch, fields)| Row { epoch, fields })
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
            s.rows.retain(|r| e.contains(r.epoch));
        }
        self.series.retain(|s| !s.rows.is_empty());
        self.extents = self.extents.crop(e);
    }

    fn crop_to_size(&mut self, n: usize, at: Epoch) {
        let epochs: BTreeSet<Epoch> = self
            .series
            .iter()
            .flat_map(|s| s.rows.iter().map(|r| r.epoch))
            .filter(|&e| e <= at)
            .collect();
        let keep: BTreeSet<Epoch> = epochs.iter().rev().take(n).copied().collect();
        for s in &mut self.series {
            s.rows.retain(|r| keep.contains(&r.epoch));
        }
        self.series.retain(|s| !s.rows.is_empty());
        match keep.first() {
            Some(&min) => {
                self.extents = self.extents.crop(Extent::new(min, at.max(min)));
            }
            None => self.extents = ExtentList::new(),
        }
    }

    fn sort(&mut self) {
        for s in &mut self.series {
            let dedup: BTreeMap<Epoch, Vec<Value>> =
                s.rows.drain(..).map(|r| (r.epoch, r.fields)).collect();
            s.rows = dedup
                .into_iter()
                .map(|(epoch, fields)| Row { epoch, fields })
                .collect();
        }
    }

    fn size(&self) -> usize {
        self.series
            .iter()
            .map(|s| s.name.len() + s.rows.len() * 24)
            .sum()
    }

    fn series_count(&self) -> usize {
        self.series.len()
    }

    fn value_count(&self) -> usize {
        self.series.iter().map(|s| s.rows.len()).sum()
    }

    fn timestamp_count(&self) -> usize {
        self.series
            .iter()
            .flat_map(|s| s.rows.iter().map(|r| r.epoch))
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
    results: Vec<WireResult>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireResult {
    #[serde(default)]
    statement_id: usize,
    #[serde(default)]
    series: Vec<WireSeries>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireSeries {
    name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    tags: BTreeMap<String, String>,
    columns: Vec<String>,
    values: Vec<Vec<Value>>,
}

/// Decodes an InfluxDB response body (`epoch=ms` convention).
pub fn unmarshal_timeseries(
    body: &[u8],
    trq: &TimeRangeQuery,
) -> Result<InfluxTimeseries, Error> {
    let doc: WireDocument =
        serde_json::from_slice(body).map_err(|e| Error::Unmarshal(e.to_string()))?;
    let mut ts = InfluxTimeseries {
        series: Vec::new(),
        extents: ExtentList::single(trq.extent),
        step: trq.step,
    };
    for result in doc.results {
        for ws in result.series {
            let mut rows = Vec::with_capacity(ws.values.len());
            for mut row in ws.values {
                if row.is_empty() {
                    continue;
                }
                let time = row.remove(0);
                let epoch = match time.as_i64() {
                    Some(ms) => ms.saturating_mul(1_000_000),
                    None => {
                        let ms = time.as_f64().ok_or_else(|| {
                            Error::Unmarshal("non-numeric time column".to_string())
                        })?;
                        (ms.trunc() as Epoch).saturating_mul(1_000_000)
                            + (ms.fract() * 1e6).round() as Epoch
                    }
                };
                rows.push(Row { epoch, fields: row });
            }
            rows.sort_by_key(|r| r.epoch);
            ts.series.push(InfluxSeries {
                name: ws.name,
                tags: ws.tags,
                columns: ws.columns,
                rows,
            });
        }
    }
    Ok(ts)
}

/// Encodes a timeseries as an InfluxDB response body (`epoch=ms`).
pub fn marshal_timeseries(ts: &InfluxTimeseries) -> Result<Vec<u8>, Error> {
    let doc = WireDocument {
        results: vec![WireResult {
            statement_id: 0,
            series: ts
                .series
                .iter()
                .filter(|s| !s.rows.is_empty())
                .map(|s| WireSeries {
                    name: s.name.clone(),
                    tags: s.tags.clone(),
                    columns: s.columns.clone(),
                    values: s
                        .rows
                        .iter()
                        .map(|r| {
                            let mut row: Vec<Value> =
                                Vec::with_capacity(r.fields.len() + 1);
                            row.push(Value::from(r.epoch / 1_000_000));
                            row.extend(r.fields.iter().cloned());
                            row
                        })
                        .collect(),
                })
                .collect(),
        }],
    };
    serde_json::to_vec(&doc).map_err(|e| Error::Unmarshal(e.to_string()))
}

// ── Client ───────────────────────────────────────────────────────────────

/// Origin client for InfluxDB 1.x `/query` upstreams.
pub struct InfluxClient {
    name: String,
    config: Arc<OriginConfig>,
}

impl InfluxClient {
    pub fn new(name: &str, config: Arc<OriginConfig>) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }

    /// Splits an InfluxQL statement into its normalized form (time
    /// predicate replaced by [`TIME_TOKEN`]) and the extent it names.
    fn normalize_statement(q: &str) -> Result<(String, Extent), Error> {
        let caps = re_range()
            .captures(q)
            .ok_or(Error::NotTimeRangeQuery)?;
        let now = now_ns();
        let start = if let Some(rel) = caps.name("rel") {
            now - parse_duration_ns(rel.as_str())?
        } else if let Some(abs) = caps.name("abs") {
            let v: i64 = abs
                .as_str()
                .parse()
                .map_err(|_| Error::Parse("invalid time literal".to_string()))?;
            ts_unit_to_ns(v, caps.name("absunit").map(|m| m.as_str()))
        } else {
            return Err(Error::NotTimeRangeQuery);
        };
        let end = if let Some(abse) = caps.name("abse") {
            let v: i64 = abse
                .as_str()
                .parse()
                .map_err(|_| Error::Parse("invalid time literal".to_string()))?;
            ts_unit_to_ns(v, caps.name("abseunit").map(|m| m.as_str()))
        } else {
            now
        };
        let normalized = re_range().replace(q, TIME_TOKEN).to_string();
        Ok((normalized, Extent::new(start, end)))
    }
}

impl OriginClient for InfluxClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn origin_type(&self) -> &'static str {
        "influxdb"
    }

    fn configuration(&self) -> &Arc<OriginConfig> {
        &self.config
    }

    fn default_path_configs(&self) -> Vec<PathConfig> {
        vec![
            PathConfig {
                path: "/query".to_string(),
                handler: PathHandler::DeltaProxyCache,
                methods: vec!["GET".to_string(), "POST".to_string()],
                match_type: PathMatchType::Exact,
                cache_key_params: vec![PARAM_DB.to_string(), PARAM_EPOCH.to_string()],
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
        let q = request
            .param(PARAM_Q)
            .ok_or_else(|| Error::MissingUrlParam(PARAM_Q.to_string()))?;
        let step_match = re_step()
            .captures(q)
            .and_then(|c| c.name("step").map(|m| m.as_str().to_string()))
            .ok_or(Error::NotTimeRangeQuery)?;
        let step = parse_duration_ns(&step_match)?;
        let (statement, extent) = Self::normalize_statement(q)?;
        if step <= 0 || extent.end < extent.start {
            return Err(Error::Parse("invalid time range".to_string()));
        }
        let mut tags = BTreeMap::new();
        if let Some(db) = request.param(PARAM_DB) {
            tags.insert(PARAM_DB.to_string(), db.to_string());
        }
        Ok(TimeRangeQuery {
            statement,
            extent,
            step,
            tags,
        })
    }

    /// The raw `q` parameter carries the time range, so it cannot feed
    /// the fingerprint directly; the normalized statement and step stand
    /// in for it.
    fn derive_cache_key(&self, request: &ProxyRequest) -> String {
        let mut params: Vec<(String, String)> = request
            .template_params
            .iter()
            .filter(|(k, _)| k != PARAM_Q)
            .cloned()
            .collect();
        if let Ok(trq) = self.parse_time_range_query(request) {
            params.push((PARAM_Q.to_string(), trq.statement.clone()));
            params.push(("step".to_string(), trq.step.to_string()));
        } else if let Some(q) = request.template_param(PARAM_Q) {
            params.push((PARAM_Q.to_string(), q.to_string()));
        }
        let mut pc = (*request.path_config).clone();
        pc.cache_key_params = Vec::new(); // hash every surviving param
        key::derive_cache_key(
            &self.name,
            &pc,
            &request.method,
            &request.path,
            &params,
            &request.headers,
        )
    }

    fn set_extent(&self, request: &mut ProxyRequest, trq: &TimeRangeQuery, extent: &Extent) {
        let clause = format!(
            "time >= {}ms AND time < {}ms",
            extent.start / 1_000_000,
            extent.end / 1_000_000
        );
        let interpolated = trq.statement.replace(TIME_TOKEN, &clause);
        request.set_param(PARAM_Q, interpolated);
        request.set_param(PARAM_EPOCH, "ms".to_string());
    }

    /// InfluxDB has no stable instant-query endpoint, so fast-forward is
    /// unavailable for this origin type.
    fn fast_forward_request(&self, _request: &ProxyRequest) -> Result<ProxyRequest, Error> {
        Err(Error::NotTimeRangeQuery)
    }

    fn health_request(&self, request: &ProxyRequest) -> ProxyRequest {
        let mut probe = request.clone();
        let base = request
            .path
            .strip_suffix("/health")
            .unwrap_or(&request.path);
        probe.path = format!("{}/ping", base);
        probe.method = "GET".to_string();
        probe.params = Vec::new();
        probe.template_params = Vec::new();
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
            .downcast_ref::<InfluxTimeseries>()
            .ok_or_else(|| Error::Unmarshal("not an influxdb timeseries".to_string()))?;
        marshal_timeseries(ts)
    }

    fn marshal_for_cache(&self, ts: &dyn Timeseries) -> Result<Vec<u8>, Error> {
        let ts = ts
            .as_any()
            .downcast_ref::<InfluxTimeseries>()
            .ok_or_else(|| Error::Unmarshal("not an influxdb timeseries".to_string()))?;
        serde_json::to_vec(ts).map_err(|e| Error::Unmarshal(e.to_string()))
    }

    fn unmarshal_from_cache(&self, body: &[u8]) -> Result<Box<dyn Timeseries>, Error> {
        let ts: InfluxTimeseries =
            serde_json::from_slice(body).map_err(|e| Error::Unmarshal(e.to_string()))?;
        Ok(Box::new(ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_q(q: &str) -> ProxyRequest {
        ProxyRequest {
            origin_name: "flux".to_string(),
            origin: Arc::new(OriginConfig::default()),
            path_config: Arc::new(PathConfig::default()),
            method: "GET".to_string(),
            scheme: "http".to_string(),
            authority: "influx:8086".to_string(),
            path: "/query".to_string(),
            params: vec![
                (PARAM_Q.to_string(), q.to_string()),
                (PARAM_DB.to_string(), "telegraf".to_string()),
            ],
            template_params: vec![
                (PARAM_Q.to_string(), q.to_string()),
                (PARAM_DB.to_string(), "telegraf".to_string()),
            ],
            headers: hyper::header::HeaderMap::new(),
            body: bytes::Bytes::new(),
            remote_addr: String::new(),
        }
    }

    #[test]
    fn test_parse_absolute_range() {
        let client = InfluxClient::new("flux", Arc::new(OriginConfig::default()));
        let q = "SELECT mean(usage) FROM cpu WHERE time >= 100000ms AND time < 200000ms GROUP BY time(10s)";
        let trq = client
            .parse_time_range_query(&request_with_q(q))
            .unwrap();
        assert_eq!(trq.extent.start, 100_000 * 1_000_000);
        assert_eq!(trq.extent.end, 200_000 * 1_000_000);
        assert_eq!(trq.step, 10_000_000_000);
        assert!(trq.statement.contains(TIME_TOKEN));
        assert!(!trq.statement.contains("100000ms"));
    }

    #[test]
    fn test_parse_relative_range() {
        let client = InfluxClient::new("flux", Arc::new(OriginConfig::default()));
        let q = "SELECT mean(usage) FROM cpu WHERE time > now() - 6h GROUP BY time(60s)";
        let trq = client
            .parse_time_range_query(&request_with_q(q))
            .unwrap();
        let span = trq.extent.end - trq.extent.start;
        assert_eq!(span, 6 * 3600 * 1_000_000_000);
        assert_eq!(trq.step, 60_000_000_000);
    }

    #[test]
    fn test_parse_without_group_by_is_not_range_query() {
        let client = InfluxClient::new("flux", Arc::new(OriginConfig::default()));
        let q = "SELECT * FROM cpu WHERE time > now() - 1h";
        assert!(matches!(
            client.parse_time_range_query(&request_with_q(q)),
            Err(Error::NotTimeRangeQuery)
        ));
    }

    #[test]
    fn test_set_extent_interpolates() {
        let client = InfluxClient::new("flux", Arc::new(OriginConfig::default()));
        let q = "SELECT mean(usage) FROM cpu WHERE time >= 100000ms AND time < 200000ms GROUP BY time(10s)";
        let mut request = request_with_q(q);
        let trq = client.parse_time_range_query(&request).unwrap();
        client.set_extent(
            &mut request,
            &trq,
            &Extent::new(150_000 * 1_000_000, 180_000 * 1_000_000),
        );
        let rewritten = request.param(PARAM_Q).unwrap();
        assert!(rewritten.contains("time >= 150000ms AND time < 180000ms"));
        assert!(!rewritten.contains(TIME_TOKEN));
        assert_eq!(request.param(PARAM_EPOCH), Some("ms"));
    }

    #[test]
    fn test_cache_key_ignores_time_range() {
        let client = InfluxClient::new("flux", Arc::new(OriginConfig::default()));
        let a = client.derive_cache_key(&request_with_q(
            "SELECT mean(usage) FROM cpu WHERE time >= 100000ms AND time < 200000ms GROUP BY time(10s)",
        ));
        let b = client.derive_cache_key(&request_with_q(
            "SELECT mean(usage) FROM cpu WHERE time >= 900000ms AND time < 990000ms GROUP BY time(10s)",
        ));
        assert_eq!(a, b);
        let c = client.derive_cache_key(&request_with_q(
            "SELECT max(usage) FROM cpu WHERE time >= 100000ms AND time < 200000ms GROUP BY time(10s)",
        ));
        assert_ne!(a, c);
    }

    #[test]
    fn test_wire_round_trip() {
        let body = br#"{"results":[{"statement_id":0,"series":[
            {"name":"cpu","columns":["time","value"],"values":[[100000,1.5],[110000,2.5]]}
        ]}]}"#;
        let trq = TimeRangeQuery {
            statement: "s".to_string(),
            extent: Extent::new(100_000 * 1_000_000, 120_000 * 1_000_000),
            step: 10_000_000_000,
            tags: BTreeMap::new(),
        };
        let ts = unmarshal_timeseries(body, &trq).unwrap();
        assert_eq!(ts.value_count(), 2);
        assert_eq!(ts.series[0].rows[0].epoch, 100_000 * 1_000_000);
        let out = marshal_timeseries(&ts).unwrap();
        let back = unmarshal_timeseries(&out, &trq).unwrap();
        assert_eq!(back.series[0].rows, ts.series[0].rows);
    }

    #[test]
    fn test_merge_overrides_and_unions() {
        let trq = TimeRangeQuery {
            statement: "s".to_string(),
            extent: Extent::new(0, 0),
            step: 10,
            tags: BTreeMap::new(),
        };
        let mut a = unmarshal_timeseries(
            br#"{"results":[{"series":[{"name":"cpu","columns":["time","value"],"values":[[1,10],[2,20]]}]}]}"#,
            &TimeRangeQuery { extent: Extent::new(1_000_000, 3_000_000), ..trq.clone() },
        )
        .unwrap();
        let b = unmarshal_timeseries(
            br#"{"results":[{"series":[{"name":"cpu","columns":["time","value"],"values":[[2,99],[3,30]]}]}]}"#,
            &TimeRangeQuery { extent: Extent::new(2_000_000, 4_000_000), ..trq },
        )
        .unwrap();
        a.merge(true, Box::new(b));
        assert_eq!(a.value_count(), 3);
        let row2 = &a.series[0].rows[1];
        assert_eq!(row2.fields[0], serde_json::json!(99));
        assert_eq!(a.extents.0, vec![Extent::new(1_000_000, 4_000_000)]);
    }
}
