use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tdp_core::IngestError;
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Ingest(IngestError),

    #[error("upstream csv unavailable: {0}")]
    Upstream(IngestError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self, "request failed");
        match &self {
            ApiError::Ingest(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string(), "stage": err.stage() })),
            )
                .into_response(),
            ApiError::Upstream(_) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
            ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": self.to_string() })),
            )
                .into_response(),
        }
    }
}
