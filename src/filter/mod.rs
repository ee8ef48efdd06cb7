pub mod access;
pub mod analysis;
pub mod circuit;
pub mod headers;
pub mod iplist;
pub mod rate_limit;
pub mod validate;
pub mod xforward;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, StatusCode};

use crate::config::FilterSpec;
use crate::error::{GatewayError, Result};
use crate::model::{Analysis, Api, Node, RequestMeta, Server};

pub const FILTER_HTTP_ACCESS: &str = "HTTP-ACCESS";
pub const FILTER_HEAD: &str = "HEAD";
pub const FILTER_XFORWARD: &str = "XFORWARD";
pub const FILTER_BLACKLIST: &str = "BLACKLIST";
pub const FILTER_WHITELIST: &str = "WHITELIST";
pub const FILTER_ANALYSIS: &str = "ANALYSIS";
pub const FILTER_RATE_LIMITING: &str = "RATE-LIMITING";
pub const FILTER_CIRCUIT_BREAKE: &str = "CIRCUIT-BREAKE";
pub const FILTER_VALIDATION: &str = "VALIDATION";

/// Per-dispatch state shared across the filter chain. `start_at`/`end_at`
/// bracket the backend call; `status` carries the backend response code on
/// the post path.
pub struct FilterContext<'a> {
    pub req: &'a RequestMeta,
    pub outbound_headers: &'a mut HeaderMap,
    pub api: &'a Api,
    pub node_index: usize,
    pub server: &'a Arc<Server>,
    pub analysis: &'a Arc<Analysis>,
    pub start_at: Option<Instant>,
    pub end_at: Option<Instant>,
    pub status: u16,
}

impl<'a> FilterContext<'a> {
    pub fn node(&self) -> &Node {
        &self.api.spec.nodes[self.node_index]
    }

    /// Backend service time, zero until both marks are set
    pub fn elapsed(&self) -> Duration {
        match (self.start_at, self.end_at) {
            (Some(start), Some(end)) => end.duration_since(start),
            _ => Duration::ZERO,
        }
    }
}

/// A hook around the backend call. Pre runs before dispatch and may reject;
/// post runs after a successful response; post_err runs after a transport
/// error or 5xx.
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    fn pre(&self, _ctx: &mut FilterContext<'_>) -> Result<()> {
        Ok(())
    }

    fn post(&self, _ctx: &mut FilterContext<'_>) -> Result<()> {
        Ok(())
    }

    fn post_err(&self, _ctx: &mut FilterContext<'_>) {}
}

/// Rejection produced by a filter, carrying the response code to use
pub fn reject(filter: &'static str, status: StatusCode, reason: impl Into<String>) -> GatewayError {
    GatewayError::FilterReject {
        filter,
        status,
        reason: reason.into(),
    }
}

/// Build a filter from its configured name. External filters are embedded at
/// build time and resolved through the same registry.
pub fn new_filter(spec: &FilterSpec) -> Result<Box<dyn Filter>> {
    if spec.external {
        return Err(GatewayError::ConfigInvalid(format!(
            "external filter <{}> is not embedded in this build",
            spec.name
        )));
    }

    match spec.name.to_uppercase().as_str() {
        FILTER_HTTP_ACCESS => Ok(Box::new(access::AccessFilter)),
        FILTER_HEAD => Ok(Box::new(headers::HeadersFilter)),
        FILTER_XFORWARD => Ok(Box::new(xforward::XForwardFilter)),
        FILTER_BLACKLIST => Ok(Box::new(iplist::BlackListFilter)),
        FILTER_WHITELIST => Ok(Box::new(iplist::WhiteListFilter)),
        FILTER_ANALYSIS => Ok(Box::new(analysis::AnalysisFilter)),
        FILTER_RATE_LIMITING => Ok(Box::new(rate_limit::RateLimitFilter::new())),
        FILTER_CIRCUIT_BREAKE => Ok(Box::new(circuit::CircuitBreakerFilter)),
        FILTER_VALIDATION => Ok(Box::new(validate::ValidationFilter)),
        other => Err(GatewayError::ConfigInvalid(format!(
            "unknown filter: {}",
            other
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::model::{ApiSpec, ServerSpec};

    pub struct CtxParts {
        pub req: RequestMeta,
        pub outbound: HeaderMap,
        pub api: Api,
        pub server: Arc<Server>,
        pub analysis: Arc<Analysis>,
    }

    impl CtxParts {
        pub fn new(api: ApiSpec, server: ServerSpec, req: RequestMeta) -> Self {
            Self {
                req,
                outbound: HeaderMap::new(),
                api: Api::parse(api).unwrap(),
                server: Arc::new(Server::new(server).unwrap()),
                analysis: Arc::new(Analysis::new()),
            }
        }

        pub fn ctx(&mut self) -> FilterContext<'_> {
            FilterContext {
                req: &self.req,
                outbound_headers: &mut self.outbound,
                api: &self.api,
                node_index: 0,
                server: &self.server,
                analysis: &self.analysis,
                start_at: None,
                end_at: None,
                status: 0,
            }
        }
    }

    pub fn simple_api() -> ApiSpec {
        ApiSpec {
            url: "/hello".to_string(),
            method: "GET".to_string(),
            nodes: vec![Node {
                cluster_name: "c1".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    pub fn simple_server(addr: &str) -> ServerSpec {
        ServerSpec {
            addr: addr.to_string(),
            ..Default::default()
        }
    }

    pub fn simple_req() -> RequestMeta {
        RequestMeta::new(
            "GET".into(),
            "/hello".into(),
            String::new(),
            None,
            HeaderMap::new(),
            Some("192.168.1.7".parse().unwrap()),
        )
    }
}
