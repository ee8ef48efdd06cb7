use std::num::NonZeroU32;

use axum::http::StatusCode;
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tracing::warn;

use super::{reject, Filter, FilterContext, FILTER_RATE_LIMITING};
use crate::error::Result;

/// Token bucket per backend at the server's maxQPS. Exhaustion answers 429
/// and records a reject in the analyzer. A server with maxQPS 0 is
/// unlimited.
pub struct RateLimitFilter {
    limiters: DashMap<String, (u32, DefaultDirectRateLimiter)>,
}

impl RateLimitFilter {
    pub fn new() -> Self {
        Self {
            limiters: DashMap::new(),
        }
    }

    fn build(qps: u32) -> DefaultDirectRateLimiter {
        let rate = NonZeroU32::new(qps).unwrap_or(NonZeroU32::MIN);
        RateLimiter::direct(Quota::per_second(rate))
    }
}

impl Default for RateLimitFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for RateLimitFilter {
    fn name(&self) -> &'static str {
        FILTER_RATE_LIMITING
    }

    fn pre(&self, ctx: &mut FilterContext<'_>) -> Result<()> {
        let qps = ctx.server.breaker().max_qps;
        if qps == 0 {
            return Ok(());
        }

        let addr = ctx.server.addr.clone();
        let mut entry = self
            .limiters
            .entry(addr.clone())
            .or_insert_with(|| (qps, Self::build(qps)));

        // server tunables can change at runtime; rebuild on a new quota
        if entry.0 != qps {
            *entry = (qps, Self::build(qps));
        }

        let admitted = entry.1.check().is_ok();
        drop(entry);

        if admitted {
            Ok(())
        } else {
            warn!("filter: <{}> over {} qps, rejecting", addr, qps);
            ctx.analysis.reject(&addr);
            Err(reject(
                FILTER_RATE_LIMITING,
                StatusCode::TOO_MANY_REQUESTS,
                format!("{} over max qps", addr),
            ))
        }
    }
}
