//! Trickster is a caching reverse proxy for time-series databases. It
//! understands the time range of each query: the portion already cached
//! is served locally, only the missing deltas are fetched from the
//! origin, and concurrent identical requests collapse into a single
//! upstream call.

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod origins;
pub mod proxy;
pub mod reload;
pub mod routing;
pub mod telemetry;
pub mod timeseries;
