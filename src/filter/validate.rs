use axum::http::StatusCode;

use super::{reject, Filter, FilterContext, FILTER_VALIDATION};
use crate::error::Result;

/// Enforces the node's declared request validations (required values and
/// regex rules over query string, headers and cookies).
pub struct ValidationFilter;

impl Filter for ValidationFilter {
    fn name(&self) -> &'static str {
        FILTER_VALIDATION
    }

    fn pre(&self, ctx: &mut FilterContext<'_>) -> Result<()> {
        ctx.api
            .validate_node(ctx.node_index, ctx.req)
            .map_err(|reason| reject(FILTER_VALIDATION, StatusCode::BAD_REQUEST, reason))
    }
}
