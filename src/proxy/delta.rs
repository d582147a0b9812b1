use bytes::Bytes;
use hyper::header::HeaderValue;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::index::now_ns;
use crate::cache::locker::Locker;
use crate::cache::{Cache, LookupStatus};
use crate::error::Error;
use crate::origins::OriginClient;
use crate::proxy::EngineResponse;
use crate::proxy::object::parse_cache_control;
use crate::proxy::request::{FetchPool, ProxyRequest};
use crate::timeseries::{
    floor_to_step, Extent, ExtentList, TimeRangeQuery, Timeseries,
};

/// Short-lived side cache for fast-forward bodies, keyed by fingerprint.
/// Deliberately separate from the main cache: fast-forward data is
/// volatile and never persisted.
pub type FastForwardCache = moka::future::Cache<String, Bytes>;

pub fn new_fast_forward_cache(ttl_ms: u64) -> FastForwardCache {
    moka::future::Cache::builder()
        .max_capacity(10_000)
        .time_to_live(std::time::Duration::from_millis(ttl_ms.max(1)))
        .build()
}

/// The cached series and its extent list, or nothing usable.
struct CachedState {
    ts: Option<Box<dyn Timeseries>>,
    extents: ExtentList,
    key_exists: bool,
}

async fn read_cached(
    cache: &Arc<dyn Cache>,
    client: &Arc<dyn OriginClient>,
    key: &str,
    step: i64,
) -> CachedState {
    match cache.retrieve(key, false).await {
        Ok(bytes) => match client.unmarshal_from_cache(&bytes) {
            Ok(ts) => {
                // a cached entry at a different resolution is useless to
                // this request; resampling is not a valid operation here
                if ts.step() != step {
                    debug!(key, cached_step = ts.step(), step, "cached step mismatch, invalidating");
                    return CachedState {
                        ts: None,
                        extents: ExtentList::new(),
                        key_exists: true,
                    };
                }
                let extents = ts.extents();
                CachedState {
                    ts: Some(ts),
                    extents,
                    key_exists: true,
                }
            }
            Err(e) => {
                warn!(key, "cached timeseries unreadable, refetching: {}", e);
                CachedState {
                    ts: None,
                    extents: ExtentList::new(),
                    key_exists: true,
                }
            }
        },
        Err(Error::CacheMiss(_)) => CachedState {
            ts: None,
            extents: ExtentList::new(),
            key_exists: false,
        },
        Err(e) => {
            // read errors degrade to a key miss
            warn!(key, "cache read failed: {}", e);
            CachedState {
                ts: None,
                extents: ExtentList::new(),
                key_exists: false,
            }
        }
    }
}

/// Gap analysis: the extents the origin must be asked for. Cached data
/// newer than the backfill-tolerance horizon is treated as absent, so the
/// volatile tail is always refetched.
fn find_needed(cached: &ExtentList, trq: &TimeRangeQuery, bft: Option<i64>) -> ExtentList {
    let stable = match bft {
        Some(horizon) => cached.crop(Extent::new(
            i64::MIN / 2,
            floor_to_step(horizon, trq.step),
        )),
        None => cached.clone(),
    };
    stable.calculate_deltas(trq.extent, trq.step)
}

fn classify(state: &CachedState, trq: &TimeRangeQuery, needed: &ExtentList) -> LookupStatus {
    if needed.is_empty() {
        return LookupStatus::Hit;
    }
    if !state.extents.crop(trq.extent).is_empty() {
        return LookupStatus::PartialHit;
    }
    if state.key_exists {
        return LookupStatus::RangeMiss;
    }
    LookupStatus::KeyMiss
}

/// The time-series caching path: gap analysis against the cached extent
/// list, parallel delta fetches for what is missing, merge, persist, and
/// a response cropped to exactly the requested window.
pub async fn delta_proxy_cache_request(
    request: &ProxyRequest,
    trq: TimeRangeQuery,
    client: &Arc<dyn OriginClient>,
    cache: &Arc<dyn Cache>,
    locker: &Arc<Locker>,
    pool: &Arc<FetchPool>,
    ff_cache: &FastForwardCache,
) -> EngineResponse {
    let mut trq = trq;
    let now = now_ns();

    // normalize: clamp the future away, snap to step boundaries
    if trq.extent.end > now {
        trq.extent.end = now;
    }
    trq.normalize_extent();
    if trq.extent.is_empty() {
        return EngineResponse::from_error(&Error::Parse("empty time range".to_string()));
    }
    let bft = if request.origin.backfill_tolerance_ns() > 0 {
        Some(now - request.origin.backfill_tolerance_ns())
    } else {
        None
    };

    let key = client.derive_cache_key(request);
    let client_cc = parse_cache_control(&request.headers);

    // read-locked lookup and gap analysis
    let (state, needed, status) = if client_cc.no_cache {
        let state = CachedState {
            ts: None,
            extents: ExtentList::new(),
            key_exists: false,
        };
        let needed = find_needed(&state.extents, &trq, bft);
        (state, needed, LookupStatus::Purge)
    } else {
        let read_lock = locker.rlock(&key).await;
        let state = read_cached(cache, client, &key, trq.step).await;
        drop(read_lock);
        let needed = find_needed(&state.extents, &trq, bft);
        let status = classify(&state, &trq, &needed);
        (state, needed, status)
    };

    if needed.is_empty() {
        if let Some(ts) = state.ts {
            debug!(key, "delta cache full hit");
            return respond(request, &trq, client, ts, LookupStatus::Hit, ExtentList::new(), ff_cache, now).await;
        }
    }

    // backpressure: a deep queue means the origin is already saturated;
    // pass this one through rather than pile on
    if pool.is_overloaded() {
        pool.record_overload();
        return proxy_only(request, client).await;
    }

    // fill under the write lock, re-checking the gap first in case a
    // concurrent request already did the work
    let write_lock = locker.lock(&key).await;
    let (state, needed, status) = if client_cc.no_cache {
        (state, needed, status)
    } else {
        let state = read_cached(cache, client, &key, trq.step).await;
        let needed = find_needed(&state.extents, &trq, bft);
        let status = classify(&state, &trq, &needed);
        (state, needed, status)
    };

    if needed.is_empty() {
        if let Some(ts) = state.ts {
            debug!(key, "delta filled by a concurrent request");
            let _read = write_lock.downgrade();
            return respond(request, &trq, client, ts, LookupStatus::Hit, ExtentList::new(), ff_cache, now).await;
        }
    }

    let mut tasks = tokio::task::JoinSet::new();
    for extent in needed.iter().copied() {
        let mut sub = request.clone();
        client.set_extent(&mut sub, &trq, &extent);
        let sub_trq = TimeRangeQuery {
            extent,
            ..trq.clone()
        };
        let client = Arc::clone(client);
        let pool = Arc::clone(pool);
        tasks.spawn(async move {
            let _permit = pool.acquire().await;
            let response = sub.fetch().await?;
            if response.status != 200 {
                return Err(Error::Upstream(response.status));
            }
            let mut ts = client.unmarshal_timeseries(&response.body, &sub_trq)?;
            // trust only the window we asked for
            ts.crop_to_range(extent);
            ts.set_extents(ExtentList::single(extent));
            Ok::<(Extent, Box<dyn Timeseries>), Error>((extent, ts))
        });
    }

    let mut partials: Vec<(Extent, Box<dyn Timeseries>)> = Vec::new();
    let mut failure: Option<Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(partial)) => partials.push(partial),
            Ok(Err(e)) => {
                // origin is authoritative: one failed delta fails the
                // request, and the siblings are cancelled
                failure = Some(e);
                tasks.abort_all();
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                failure = Some(Error::Lock(format!("delta fetch task failed: {}", e)));
                tasks.abort_all();
            }
        }
    }
    if let Some(e) = failure {
        drop(write_lock);
        warn!(key, "delta fetch failed: {}", e);
        return EngineResponse::from_error(&e).with_fetched(needed);
    }

    // merge ascending by extent start, into the cached base
    partials.sort_by_key(|(e, _)| e.start);
    let mut merged: Option<Box<dyn Timeseries>> = state.ts;
    for (_, partial) in partials {
        match merged.as_mut() {
            Some(base) => base.merge(true, partial),
            None => merged = Some(partial),
        }
    }
    let Some(merged) = merged else {
        drop(write_lock);
        return EngineResponse::from_error(&Error::Upstream(502));
    };

    // trim for retention without dropping what this request needs,
    // persist, then hand the lock down to the read side
    if !client_cc.no_store {
        let mut stored = merged.clone_box();
        let request_timestamps =
            ((trq.extent.end - trq.extent.start) / trq.step.max(1)) as usize;
        let retention = request
            .origin
            .timeseries_retention_factor
            .max(request_timestamps);
        stored.crop_to_size(retention, now);
        match client.marshal_for_cache(stored.as_ref()) {
            Ok(bytes) => {
                if let Err(e) = cache
                    .store(&key, bytes, request.origin.timeseries_ttl())
                    .await
                {
                    warn!(key, "timeseries cache write failed: {}", e);
                }
            }
            Err(e) => warn!(key, "timeseries cache marshal failed: {}", e),
        }
    }
    let _read = write_lock.downgrade();

    respond(request, &trq, client, merged, status, needed, ff_cache, now).await
}

/// Crops to the request window, merges any fast-forward sample into
/// the response only, and marshals to the wire.
#[allow(clippy::too_many_arguments)]
async fn respond(
    request: &ProxyRequest,
    trq: &TimeRangeQuery,
    client: &Arc<dyn OriginClient>,
    mut ts: Box<dyn Timeseries>,
    status: LookupStatus,
    fetched: ExtentList,
    ff_cache: &FastForwardCache,
    now: i64,
) -> EngineResponse {
    ts.crop_to_range(trq.extent);

    if !request.origin.fast_forward_disable && trq.extent.end >= now - trq.step {
        if let Some(ff) = fast_forward(request, trq, client, ff_cache).await {
            ts.merge(true, ff);
        }
    }

    match client.marshal_timeseries(ts.as_ref()) {
        Ok(body) => {
            let mut response = EngineResponse::new(200, status)
                .with_body(Bytes::from(body))
                .with_fetched(fetched);
            response.headers.insert(
                hyper::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => EngineResponse::from_error(&e),
    }
}

/// The most-recent-sample fetch, answered from the moka side cache
/// when a sibling already paid for it. All failures are non-fatal.
async fn fast_forward(
    request: &ProxyRequest,
    trq: &TimeRangeQuery,
    client: &Arc<dyn OriginClient>,
    ff_cache: &FastForwardCache,
) -> Option<Box<dyn Timeseries>> {
    let ff_request = match client.fast_forward_request(request) {
        Ok(r) => r,
        Err(_) => return None,
    };
    let ff_key = format!("ff.{}", client.derive_cache_key(request));

    let body = match ff_cache.get(&ff_key).await {
        Some(body) => body,
        None => {
            let response = match ff_request.fetch().await {
                Ok(r) if r.status == 200 => r,
                Ok(r) => {
                    debug!(status = r.status, "fast-forward fetch skipped");
                    return None;
                }
                Err(e) => {
                    debug!("fast-forward fetch failed: {}", e);
                    return None;
                }
            };
            ff_cache.insert(ff_key, response.body.clone()).await;
            response.body
        }
    };

    match client.unmarshal_instantaneous(&body, trq) {
        Ok(ts) => Some(ts),
        Err(e) => {
            debug!("fast-forward unmarshal failed: {}", e);
            None
        }
    }
}

/// Overload short-circuit: no cache interaction at all, one passthrough
/// fetch, `proxy-only` recorded for the result header.
async fn proxy_only(request: &ProxyRequest, client: &Arc<dyn OriginClient>) -> EngineResponse {
    debug!(origin = %client.name(), "fetch pool overloaded, proxying directly");
    match request.fetch().await {
        Ok(response) => EngineResponse::new(response.status, LookupStatus::ProxyOnly)
            .with_headers(response.headers)
            .with_body(response.body),
        Err(e) => EngineResponse::from_error(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trq(start: i64, end: i64, step: i64) -> TimeRangeQuery {
        TimeRangeQuery {
            statement: "up".to_string(),
            extent: Extent::new(start, end),
            step,
            tags: Default::default(),
        }
    }

    fn el(parts: &[(i64, i64)]) -> ExtentList {
        let mut l = ExtentList(parts.iter().map(|&(s, e)| Extent::new(s, e)).collect());
        l.normalize();
        l
    }

    #[test]
    fn test_find_needed_cold() {
        let needed = find_needed(&ExtentList::new(), &trq(100, 200, 10), None);
        assert_eq!(needed.0, vec![Extent::new(100, 200)]);
    }

    #[test]
    fn test_find_needed_partial() {
        let needed = find_needed(&el(&[(150, 200)]), &trq(100, 200, 10), None);
        assert_eq!(needed.0, vec![Extent::new(100, 150)]);
    }

    #[test]
    fn test_find_needed_backfill_tolerance() {
        // cache covers the whole window, but the tail is volatile
        let needed = find_needed(&el(&[(100, 200)]), &trq(100, 200, 10), Some(160));
        assert_eq!(needed.0, vec![Extent::new(160, 200)]);
    }

    #[test]
    fn test_find_needed_backfill_horizon_floors_to_step() {
        let needed = find_needed(&el(&[(100, 200)]), &trq(100, 200, 10), Some(165));
        assert_eq!(needed.0, vec![Extent::new(160, 200)]);
    }

    #[test]
    fn test_classify() {
        let cold = CachedState {
            ts: None,
            extents: ExtentList::new(),
            key_exists: false,
        };
        let query = trq(100, 200, 10);
        let needed = el(&[(100, 200)]);
        assert_eq!(classify(&cold, &query, &needed), LookupStatus::KeyMiss);

        let range_miss = CachedState {
            ts: None,
            extents: el(&[(300, 400)]),
            key_exists: true,
        };
        assert_eq!(
            classify(&range_miss, &query, &needed),
            LookupStatus::RangeMiss
        );

        let partial = CachedState {
            ts: None,
            extents: el(&[(150, 200)]),
            key_exists: true,
        };
        let needed = el(&[(100, 150)]);
        assert_eq!(classify(&partial, &query, &needed), LookupStatus::PartialHit);

        assert_eq!(
            classify(&partial, &query, &ExtentList::new()),
            LookupStatus::Hit
        );
    }
}
