use axum::http::HeaderValue;

use super::{Filter, FilterContext, FILTER_XFORWARD};
use crate::error::Result;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Appends the client address to X-Forwarded-For and sets X-Real-IP on the
/// outbound request.
pub struct XForwardFilter;

impl Filter for XForwardFilter {
    fn name(&self) -> &'static str {
        FILTER_XFORWARD
    }

    fn pre(&self, ctx: &mut FilterContext<'_>) -> Result<()> {
        let Some(ip) = ctx.req.client_ip else {
            return Ok(());
        };
        let ip = ip.to_string();

        let forwarded = match ctx
            .outbound_headers
            .get(X_FORWARDED_FOR)
            .and_then(|v| v.to_str().ok())
        {
            Some(existing) => format!("{}, {}", existing, ip),
            None => ip.clone(),
        };

        if let Ok(value) = HeaderValue::try_from(forwarded) {
            ctx.outbound_headers.insert(X_FORWARDED_FOR, value);
        }
        if let Ok(value) = HeaderValue::try_from(ip) {
            ctx.outbound_headers.insert(X_REAL_IP, value);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::test_support::{simple_api, simple_req, simple_server, CtxParts};

    #[test]
    fn test_sets_forward_headers() {
        let mut parts = CtxParts::new(simple_api(), simple_server("127.0.0.1:9001"), simple_req());
        let mut ctx = parts.ctx();

        XForwardFilter.pre(&mut ctx).unwrap();

        assert_eq!(ctx.outbound_headers.get(X_FORWARDED_FOR).unwrap(), "192.168.1.7");
        assert_eq!(ctx.outbound_headers.get(X_REAL_IP).unwrap(), "192.168.1.7");
    }

    #[test]
    fn test_appends_to_existing_chain() {
        let mut parts = CtxParts::new(simple_api(), simple_server("127.0.0.1:9001"), simple_req());
        parts.outbound.insert(X_FORWARDED_FOR, "10.0.0.1".parse().unwrap());
        let mut ctx = parts.ctx();

        XForwardFilter.pre(&mut ctx).unwrap();

        assert_eq!(
            ctx.outbound_headers.get(X_FORWARDED_FOR).unwrap(),
            "10.0.0.1, 192.168.1.7"
        );
    }
}
