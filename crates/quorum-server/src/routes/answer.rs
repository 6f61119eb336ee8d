use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use tokio_stream::StreamExt;

use quorum_schema::{AnswerRequest, AnswerResponse};

use super::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/answer", post(post_answer))
        .route("/answer/stream", post(post_answer_stream))
}

async fn post_answer(
    State(state): State<AppState>,
    Json(request): Json<AnswerRequest>,
) -> Result<Json<AnswerResponse>, ApiError> {
    let response = state.orchestrator.answer(request).await?;
    Ok(Json(response))
}

/// Newline-delimited JSON events; each line is a self-contained object and
/// the final line is always `{"type":"done"}`.
async fn post_answer_stream(
    State(state): State<AppState>,
    Json(request): Json<AnswerRequest>,
) -> Response {
    let events = state.orchestrator.clone().answer_stream(request);
    let body = Body::from_stream(events.map(|event| {
        let mut line = serde_json::to_string(&event).unwrap_or_else(|_| {
            r#"{"type":"error","data":{"code":"storage_error","message":"serialization failed"}}"#
                .to_string()
        });
        line.push('\n');
        Ok::<Bytes, std::convert::Infallible>(Bytes::from(line))
    }));

    ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
}
