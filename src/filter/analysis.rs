use super::{Filter, FilterContext, FILTER_ANALYSIS};
use crate::error::Result;

/// Feeds the per-backend traffic windows: request on the way in, latency and
/// status on the way out, failures on the error path.
pub struct AnalysisFilter;

impl Filter for AnalysisFilter {
    fn name(&self) -> &'static str {
        FILTER_ANALYSIS
    }

    fn pre(&self, ctx: &mut FilterContext<'_>) -> Result<()> {
        ctx.analysis.request(&ctx.server.addr);
        Ok(())
    }

    fn post(&self, ctx: &mut FilterContext<'_>) -> Result<()> {
        ctx.analysis
            .response(&ctx.server.addr, ctx.status, ctx.elapsed());
        Ok(())
    }

    fn post_err(&self, ctx: &mut FilterContext<'_>) {
        ctx.analysis.failure(&ctx.server.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::test_support::{simple_api, simple_req, simple_server, CtxParts};
    use std::time::Instant;

    #[tokio::test]
    async fn test_counters_flow_into_windows() {
        let mut parts = CtxParts::new(simple_api(), simple_server("127.0.0.1:9001"), simple_req());
        parts.analysis.add_recent_count("127.0.0.1:9001", 10);
        let analysis = parts.analysis.clone();
        analysis.start_ticker();

        {
            let mut ctx = parts.ctx();
            AnalysisFilter.pre(&mut ctx).unwrap();
            ctx.start_at = Some(Instant::now());
            ctx.end_at = Some(Instant::now());
            ctx.status = 200;
            AnalysisFilter.post(&mut ctx).unwrap();
            AnalysisFilter.post_err(&mut ctx);
        }

        // wait for the ticker to complete the current bucket
        tokio::time::sleep(std::time::Duration::from_millis(1200)).await;

        let report = analysis.report("127.0.0.1:9001", 10).unwrap();
        assert_eq!(report.requests, 1);
        assert_eq!(report.successes, 1);
        assert_eq!(report.failures, 1);
    }
}
