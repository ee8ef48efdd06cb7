use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::error::{GatewayError, Result};
use crate::model::Analysis;

/// Handle used to swap the log filter at runtime
pub type LogLevelHandle = reload::Handle<EnvFilter, Registry>;

/// Management plane: log level control, analysis points and queries, and the
/// Prometheus render endpoint.
pub struct MgrServer {
    analysis: Arc<Analysis>,
    log_handle: LogLevelHandle,
    prometheus: PrometheusHandle,
}

#[derive(Clone)]
struct MgrState {
    analysis: Arc<Analysis>,
    log_handle: LogLevelHandle,
    prometheus: PrometheusHandle,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisPointRequest {
    addr: String,
    secs: u64,
}

#[derive(Debug, Serialize)]
struct MgrResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl<T: Serialize> MgrResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }
}

impl MgrServer {
    pub fn new(
        analysis: Arc<Analysis>,
        log_handle: LogLevelHandle,
        prometheus: PrometheusHandle,
    ) -> Self {
        Self {
            analysis,
            log_handle,
            prometheus,
        }
    }

    /// Serve the management API on an already-bound listener; binding is
    /// done by the caller so address failures stay fatal at boot.
    pub async fn serve_on(self, listener: TcpListener) -> Result<()> {
        let state = MgrState {
            analysis: self.analysis,
            log_handle: self.log_handle,
            prometheus: self.prometheus,
        };

        let app = Router::new()
            .route("/mgr/log-level/:level", put(set_log_level))
            .route("/mgr/analysis", post(add_analysis_point))
            .route("/mgr/analysis/:addr/:secs", get(get_analysis))
            .route("/metrics", get(render_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        info!("rpc: mgr listen at {}", listener.local_addr()?);

        axum::serve(listener, app)
            .await
            .map_err(|e| GatewayError::Internal(format!("mgr server: {}", e)))
    }
}

pub fn valid_log_level(level: &str) -> bool {
    matches!(level, "debug" | "info" | "warn" | "error")
}

async fn set_log_level(
    State(state): State<MgrState>,
    Path(level): Path<String>,
) -> impl IntoResponse {
    if !valid_log_level(&level) {
        return (
            StatusCode::BAD_REQUEST,
            Json(MgrResponse::<()>::error(format!("bad log level: {}", level))),
        );
    }

    match state.log_handle.reload(EnvFilter::new(&level)) {
        Ok(()) => {
            info!("rpc: log level changed to <{}>", level);
            (StatusCode::OK, Json(MgrResponse::success(())))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(MgrResponse::<()>::error(e.to_string())),
        ),
    }
}

async fn add_analysis_point(
    State(state): State<MgrState>,
    Json(req): Json<AnalysisPointRequest>,
) -> impl IntoResponse {
    if req.secs == 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(MgrResponse::<()>::error("secs must be positive")),
        );
    }

    state.analysis.add_recent_count(&req.addr, req.secs);
    info!("rpc: analysis point <{}, {}s> added", req.addr, req.secs);
    (StatusCode::OK, Json(MgrResponse::success(())))
}

async fn get_analysis(
    State(state): State<MgrState>,
    Path((addr, secs)): Path<(String, u64)>,
) -> impl IntoResponse {
    match state.analysis.report(&addr, secs) {
        Some(report) => (StatusCode::OK, Json(MgrResponse::success(report))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(MgrResponse::<()>::error(format!(
                "no analysis window <{}, {}s>",
                addr, secs
            ))),
        )
            .into_response(),
    }
}

async fn render_metrics(State(state): State<MgrState>) -> impl IntoResponse {
    state.prometheus.render()
}
