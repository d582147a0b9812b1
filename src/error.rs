use thiserror::Error;

/// Unified error type for the proxy, cache, and origin client layers.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be loaded or validated.
    #[error("configuration error: {0}")]
    Config(String),

    /// The request does not carry a parseable time range query, so the
    /// delta engine cannot service it.
    #[error("request is not a time range query")]
    NotTimeRangeQuery,

    /// A URL parameter the origin client requires was absent.
    #[error("missing URL parameter: {0}")]
    MissingUrlParam(String),

    /// A query statement or parameter failed to parse.
    #[error("parse error: {0}")]
    Parse(String),

    /// The requested key is not in the cache.
    #[error("value for key [{0}] not in cache")]
    CacheMiss(String),

    /// The cache backend failed while reading. Engines degrade this to a
    /// key miss and continue via the origin.
    #[error("cache read error: {0}")]
    CacheRead(String),

    /// The cache backend failed while writing. Logged and counted; never
    /// fails the client response.
    #[error("cache write error: {0}")]
    CacheWrite(String),

    /// The upstream did not respond within the request deadline.
    #[error("upstream request timed out")]
    UpstreamTimeout,

    /// The upstream answered with a non-success status.
    #[error("upstream error: status {0}")]
    Upstream(u16),

    /// The upstream body could not be decoded into a timeseries.
    #[error("unmarshal error: {0}")]
    Unmarshal(String),

    /// An internal locking invariant was violated.
    #[error("lock error: {0}")]
    Lock(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The HTTP status this error maps to when it reaches the client.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotTimeRangeQuery
            | Error::MissingUrlParam(_)
            | Error::Parse(_) => 400,
            Error::Upstream(code) => *code,
            Error::UpstreamTimeout => 504,
            Error::Unmarshal(_) => 502,
            _ => 500,
        }
    }
}
