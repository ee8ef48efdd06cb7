use metrics::{counter, histogram};
use tracing::{info, warn};

use super::{Filter, FilterContext, FILTER_HTTP_ACCESS};
use crate::error::Result;

/// Access log: request line, backend, status and latency, plus the request
/// counters exposed on /metrics.
pub struct AccessFilter;

impl Filter for AccessFilter {
    fn name(&self) -> &'static str {
        FILTER_HTTP_ACCESS
    }

    fn post(&self, ctx: &mut FilterContext<'_>) -> Result<()> {
        let elapsed = ctx.elapsed();
        info!(
            "access: {} {} -> <{}> {} {}ms",
            ctx.req.method,
            ctx.req.path,
            ctx.server.addr,
            ctx.status,
            elapsed.as_millis()
        );

        counter!("gateway_requests_total", "backend" => ctx.server.addr.clone()).increment(1);
        histogram!("gateway_request_duration_seconds").record(elapsed.as_secs_f64());
        Ok(())
    }

    fn post_err(&self, ctx: &mut FilterContext<'_>) {
        warn!(
            "access: {} {} -> <{}> failed with {}",
            ctx.req.method, ctx.req.path, ctx.server.addr, ctx.status
        );

        counter!("gateway_requests_failed", "backend" => ctx.server.addr.clone()).increment(1);
    }
}
