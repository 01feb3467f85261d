use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use inference_engine::EngineError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Model fetch error: {0}")]
    ModelFetch(String),

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Engine protocol error: {0}")]
    EngineProtocol(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "ValidationError",
            ApiError::ModelFetch(_) => "ModelFetchError",
            ApiError::ModelLoad(_) => "ModelLoadError",
            ApiError::EngineProtocol(_) => "EngineProtocolError",
            ApiError::Engine(_) => "EngineError",
            ApiError::Busy(_) => "Busy",
            ApiError::Internal(_) => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::ModelFetch(_) => StatusCode::BAD_GATEWAY,
            ApiError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ModelLoad(_)
            | ApiError::EngineProtocol(_)
            | ApiError::Engine(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::Validation(msg)
            | ApiError::ModelFetch(msg)
            | ApiError::ModelLoad(msg)
            | ApiError::EngineProtocol(msg)
            | ApiError::Engine(msg)
            | ApiError::Busy(msg)
            | ApiError::Internal(msg) => msg,
        }
    }

    /// JSON body shared by error responses and in-stream error lines.
    pub fn body(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.kind().to_string(),
            message: self.message().to_string(),
        }
    }
}

/// Load failures map to `ModelLoad`, everything else happened during inference.
impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        if e.is_load_failure() {
            ApiError::ModelLoad(e.to_string())
        } else {
            ApiError::Engine(e.to_string())
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(e: validator::ValidationErrors) -> Self {
        ApiError::Validation(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_client_error() {
            tracing::warn!("{}: {}", self.kind(), self.message());
        } else {
            tracing::error!("{}: {}", self.kind(), self.message());
        }

        (status, Json(self.body())).into_response()
    }
}
