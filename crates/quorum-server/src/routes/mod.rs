pub mod answer;
pub mod control;
pub mod health;
pub mod sessions;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;

use quorum_core::EngineError;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .merge(answer::router())
        .nest("/sessions", sessions::router())
        .nest("/control", control::router())
        .merge(health::router())
}

/// Stable error body; internal detail never includes stack traces.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            EngineError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::ConsistencyViolation(_) | EngineError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            tracing::error!("request failed: {}", self.0);
        }
        let body = ErrorBody {
            code: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
