use bytes::Bytes;
use hyper::header::HeaderMap;

use crate::cache::LookupStatus;

pub mod delta;
pub mod headers;
pub mod key;
pub mod object;
pub mod request;
pub mod tls;

/// What an engine hands back to the frontend: the response to write and
/// the lookup status for the result header and metrics labels.
#[derive(Debug)]
pub struct EngineResponse {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub lookup_status: LookupStatus,
    /// The extents fetched from the origin, for the result header.
    pub fetched: Option<crate::timeseries::ExtentList>,
}

impl EngineResponse {
    pub fn new(status_code: u16, lookup_status: LookupStatus) -> Self {
        Self {
            status_code,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            lookup_status,
            fetched: None,
        }
    }

    pub fn with_fetched(mut self, fetched: crate::timeseries::ExtentList) -> Self {
        self.fetched = Some(fetched);
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Maps an engine error onto a client-facing response, with the
    /// cause carried in a response header.
    pub fn from_error(err: &crate::error::Error) -> Self {
        let status = err.http_status();
        let lookup = if status >= 500 {
            LookupStatus::ProxyError
        } else {
            LookupStatus::ProxyOnly
        };
        let mut response =
            Self::new(status, lookup).with_body(Bytes::from(format!("{}\n", err)));
        if let Ok(value) = hyper::header::HeaderValue::from_str(&err.to_string()) {
            response
                .headers
                .insert(hyper::header::HeaderName::from_static("x-trickster-error"), value);
        }
        response
    }
}
