use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    #[error("{entity} already exists: {key}")]
    EntityExists { entity: &'static str, key: String },

    #[error("{entity} not found: {key}")]
    EntityNotFound { entity: &'static str, key: String },

    #[error("no server available")]
    NoServer,

    #[error("rewrite does not match request url: {0}")]
    RewriteMismatch(String),

    #[error("rejected by filter {filter}: {reason}")]
    FilterReject {
        filter: &'static str,
        status: StatusCode,
        reason: String,
    },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("client canceled request")]
    ClientCancel,

    #[error("registry watch lost: {0}")]
    RegistryLost(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn exists(entity: &'static str, key: impl Into<String>) -> Self {
        GatewayError::EntityExists {
            entity,
            key: key.into(),
        }
    }

    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        GatewayError::EntityNotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::EntityExists { .. } => StatusCode::CONFLICT,
            GatewayError::EntityNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::NoServer => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RewriteMismatch(_) => StatusCode::BAD_REQUEST,
            GatewayError::FilterReject { status, .. } => *status,
            GatewayError::Backend(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::ClientCancel => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RegistryLost(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Json(_) => StatusCode::BAD_REQUEST,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
