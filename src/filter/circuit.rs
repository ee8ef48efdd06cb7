use std::time::Duration;

use axum::http::StatusCode;
use rand::Rng;
use tracing::{info, warn};

use super::{reject, Filter, FilterContext, FILTER_CIRCUIT_BREAKE};
use crate::error::Result;
use crate::model::server::BreakerParams;
use crate::model::Circuit;

/// Per-backend circuit breaker. Open admits, Close rejects with 503, Half
/// admits a sampled fraction. Transitions are evaluated here against the
/// analyzer windows so rejected traffic still lands in the counters.
pub struct CircuitBreakerFilter;

impl CircuitBreakerFilter {
    fn deny(ctx: &mut FilterContext<'_>, reason: String) -> crate::error::GatewayError {
        ctx.analysis.reject(&ctx.server.addr);
        reject(FILTER_CIRCUIT_BREAKE, StatusCode::SERVICE_UNAVAILABLE, reason)
    }

    /// Half state: admit `halfTrafficRate` percent, reject the rest
    fn sample(ctx: &mut FilterContext<'_>, breaker: &BreakerParams) -> Result<()> {
        if rand::thread_rng().gen_range(0..100) < breaker.half_traffic_rate {
            Ok(())
        } else {
            let reason = format!("{} probing, traffic sampled out", ctx.server.addr);
            Err(Self::deny(ctx, reason))
        }
    }
}

impl Filter for CircuitBreakerFilter {
    fn name(&self) -> &'static str {
        FILTER_CIRCUIT_BREAKE
    }

    fn pre(&self, ctx: &mut FilterContext<'_>) -> Result<()> {
        let server = ctx.server.clone();
        let breaker = server.breaker();

        match server.circuit() {
            Circuit::Open => {
                if breaker.open_to_close_failure_rate > 0 && breaker.open_to_close_collect_seconds > 0
                {
                    let failure_rate = ctx
                        .analysis
                        .recently_failure_rate(&server.addr, breaker.open_to_close_collect_seconds);

                    if let Some(rate) = failure_rate {
                        if rate >= breaker.open_to_close_failure_rate as f64 {
                            warn!(
                                "filter: <{}> failure rate {:.1}% tripped the circuit",
                                server.addr, rate
                            );
                            server.close_circuit();
                            return Err(Self::deny(
                                ctx,
                                format!("{} circuit tripped", server.addr),
                            ));
                        }
                    }
                }
                Ok(())
            }

            Circuit::Close => {
                let cooled = breaker.half_to_open_seconds > 0
                    && server
                        .tripped_elapsed()
                        .map(|e| e >= Duration::from_secs(breaker.half_to_open_seconds))
                        .unwrap_or(false);

                if cooled {
                    info!("filter: <{}> circuit half, probing", server.addr);
                    server.half_circuit();
                    return Self::sample(ctx, &breaker);
                }

                Err(Self::deny(
                    ctx,
                    format!("{} circuit close", server.addr),
                ))
            }

            Circuit::Half => {
                // judge the probe only after a full collect window of
                // sampled traffic
                let collected = breaker.half_to_open_collect_seconds > 0
                    && server
                        .half_elapsed()
                        .map(|e| e >= Duration::from_secs(breaker.half_to_open_collect_seconds))
                        .unwrap_or(false);

                if collected {
                    match ctx
                        .analysis
                        .recently_success_rate(&server.addr, breaker.half_to_open_collect_seconds)
                    {
                        Some(rate) if rate >= breaker.half_to_open_succeed_rate as f64 => {
                            info!("filter: <{}> circuit open again", server.addr);
                            server.open_circuit();
                            return Ok(());
                        }
                        Some(rate) => {
                            warn!(
                                "filter: <{}> probe success rate {:.1}% too low, circuit close",
                                server.addr, rate
                            );
                            server.close_circuit();
                            return Err(Self::deny(
                                ctx,
                                format!("{} circuit close", server.addr),
                            ));
                        }
                        // no sampled traffic landed yet, keep probing
                        None => {}
                    }
                }

                Self::sample(ctx, &breaker)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::test_support::{simple_api, simple_req, CtxParts};
    use crate::model::ServerSpec;

    const ADDR: &str = "127.0.0.1:9001";

    fn breaker_server() -> ServerSpec {
        ServerSpec {
            addr: ADDR.to_string(),
            open_to_close_failure_rate: 50,
            open_to_close_collect_seconds: 10,
            half_to_open_seconds: 30,
            half_traffic_rate: 40,
            half_to_open_succeed_rate: 90,
            half_to_open_collect_seconds: 10,
            ..Default::default()
        }
    }

    fn parts_with_failures(failed: u32, total: u32) -> CtxParts {
        let parts = CtxParts::new(simple_api(), breaker_server(), simple_req());
        parts.analysis.add_recent_count(ADDR, 10);
        for _ in 0..total {
            parts.analysis.request(ADDR);
        }
        for _ in 0..failed {
            parts.analysis.failure(ADDR);
        }
        // head bucket is invisible to queries until the ring advances
        parts.analysis.advance_all();
        parts
    }

    #[test]
    fn test_open_stays_open_below_threshold() {
        let mut parts = parts_with_failures(2, 10);
        let mut ctx = parts.ctx();
        assert!(CircuitBreakerFilter.pre(&mut ctx).is_ok());
        assert_eq!(parts.server.circuit(), Circuit::Open);
    }

    #[test]
    fn test_open_trips_on_failure_rate() {
        let mut parts = parts_with_failures(6, 10);

        {
            let mut ctx = parts.ctx();
            let err = CircuitBreakerFilter.pre(&mut ctx).unwrap_err();
            assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        }

        assert_eq!(parts.server.circuit(), Circuit::Close);
        parts.analysis.advance_all();
        assert_eq!(parts.analysis.recently_reject_count(ADDR, 10), 1);
    }

    #[test]
    fn test_close_rejects_until_cooldown() {
        let mut parts = parts_with_failures(0, 0);
        parts.server.close_circuit();

        let mut ctx = parts.ctx();
        let err = CircuitBreakerFilter.pre(&mut ctx).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(parts.server.circuit(), Circuit::Close);
    }

    #[test]
    fn test_half_admits_roughly_the_configured_fraction() {
        let mut parts = parts_with_failures(0, 0);
        parts.server.half_circuit();

        let mut admitted = 0;
        for _ in 0..1000 {
            let mut ctx = parts.ctx();
            if CircuitBreakerFilter.pre(&mut ctx).is_ok() {
                admitted += 1;
            }
        }

        // 40% of 1000 with generous slack
        assert!(admitted > 250, "admitted {}", admitted);
        assert!(admitted < 550, "admitted {}", admitted);
        assert_eq!(parts.server.circuit(), Circuit::Half);
    }
}
