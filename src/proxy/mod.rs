pub mod client;
pub mod engine;

pub use engine::Proxy;

use axum::http::{HeaderMap, HeaderName};
use bytes::Bytes;

use crate::error::GatewayError;

/// Errors whose text starts with this come from the caller going away, not
/// from the backend; they bypass counters and the error filters.
pub const ERR_PREFIX_REQUEST_CANCEL: &str = "request canceled";

/// Content type of merged responses
pub const MERGE_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Backend headers dropped before copying into a merged response
pub const MERGE_REMOVE_HEADERS: &[&str] = &["content-length", "content-type", "date"];

/// What one backend answered
#[derive(Debug)]
pub struct BackendResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Result of dispatching one route node
#[derive(Debug)]
pub struct NodeOutcome {
    pub res: Option<BackendResponse>,
    pub err: Option<GatewayError>,
    pub code: u16,
}

impl NodeOutcome {
    pub fn ok(res: BackendResponse) -> Self {
        Self {
            code: res.status,
            res: Some(res),
            err: None,
        }
    }

    pub fn fail(err: GatewayError) -> Self {
        let code = err.status_code().as_u16();
        Self {
            res: None,
            err: Some(err),
            code,
        }
    }

    pub fn fail_with_code(err: GatewayError, code: u16) -> Self {
        Self {
            res: None,
            err: Some(err),
            code,
        }
    }

    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }
}

pub fn is_hop_by_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
    )
}

/// Caller-cancel detection by error-text prefix, walking the source chain
pub fn is_client_cancel(err: &reqwest::Error) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if e.to_string().starts_with(ERR_PREFIX_REQUEST_CANCEL) {
            return true;
        }
        current = e.source();
    }
    false
}
