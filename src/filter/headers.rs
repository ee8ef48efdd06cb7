use axum::http::{HeaderName, HeaderValue};
use tracing::warn;

use super::{Filter, FilterContext, FILTER_HEAD};
use crate::error::Result;

/// Applies the API's declared header add/remove/rename operations to the
/// outbound request.
pub struct HeadersFilter;

impl Filter for HeadersFilter {
    fn name(&self) -> &'static str {
        FILTER_HEAD
    }

    fn pre(&self, ctx: &mut FilterContext<'_>) -> Result<()> {
        let Some(ops) = ctx.api.spec.head_ops.clone() else {
            return Ok(());
        };

        for pair in &ops.add {
            match (
                HeaderName::try_from(pair.name.as_str()),
                HeaderValue::try_from(pair.value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    ctx.outbound_headers.insert(name, value);
                }
                _ => warn!("filter: head add <{}> skipped, invalid header", pair.name),
            }
        }

        for name in &ops.remove {
            ctx.outbound_headers.remove(name.as_str());
        }

        for rename in &ops.rename {
            if let Some(value) = ctx.outbound_headers.remove(rename.from.as_str()) {
                match HeaderName::try_from(rename.to.as_str()) {
                    Ok(name) => {
                        ctx.outbound_headers.insert(name, value);
                    }
                    Err(_) => warn!("filter: head rename to <{}> skipped", rename.to),
                }
            }
        }

        Ok(())
    }
}
