//! HTTP API handlers: exposes coordinator, cache and scaler state as JSON.

pub mod cache;
pub mod events;
pub mod status;
pub mod workflow;

use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use hive_core::HiveError;
use hive_services::{Coordinator, DistributedCache, Scaler};

#[derive(Clone)]
pub struct ApiState {
    pub coordinator: Coordinator,
    pub cache: DistributedCache,
    /// Present only when the scaler is enabled in this process.
    pub scaler: Option<Arc<Scaler>>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

/// Error body: `{success: false, error, message}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
}

/// A [`HiveError`] rendered as a structured HTTP error.
#[derive(Debug)]
pub struct ApiError(pub HiveError);

impl From<HiveError> for ApiError {
    fn from(e: HiveError) -> Self {
        Self(e)
    }
}

// Extractor rejections answer with the same body as every other error.

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(HiveError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(HiveError::Validation(rejection.body_text()))
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self(HiveError::Validation(rejection.body_text()))
    }
}

pub fn status_for(e: &HiveError) -> StatusCode {
    match e {
        HiveError::Validation(_) => StatusCode::BAD_REQUEST,
        HiveError::NotFound(_) => StatusCode::NOT_FOUND,
        HiveError::Capacity(_) => StatusCode::PAYLOAD_TOO_LARGE,
        HiveError::TaskFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
        HiveError::Transport(_) => StatusCode::BAD_GATEWAY,
        HiveError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        HiveError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::warn!(error = %self.0, %status, "request failed");
        }
        let body = ErrorBody {
            success: false,
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

// Re-export handler functions for use in router setup.
pub use cache::{handle_cache_clear, handle_cache_info, handle_cache_invalidate, handle_cache_stats};
pub use events::handle_events;
pub use status::{handle_activate, handle_deactivate, handle_scaler, handle_status};
pub use workflow::{handle_workflow_start, handle_workflow_status};
