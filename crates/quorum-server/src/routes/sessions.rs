use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use quorum_core::EngineError;
use quorum_schema::{Message, Session, SessionView};

use super::ApiError;
use crate::state::AppState;

const DEFAULT_OWNER: &str = "default";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(create_session).get(list_sessions))
        .route(
            "/{id}",
            get(get_session).delete(delete_session).patch(rename_session),
        )
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct SessionQuery {
    #[serde(default)]
    view: Option<SessionView>,
}

#[derive(Serialize)]
struct SessionDetail {
    session: Session,
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct RenameRequest {
    title: String,
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let session = state
        .orchestrator
        .memory()
        .sessions()
        .create(DEFAULT_OWNER, request.title.as_deref())
        .await
        .map_err(EngineError::storage)?;
    Ok(Json(CreateSessionResponse {
        session_id: session.id,
    }))
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<Session>>, ApiError> {
    let sessions = state
        .orchestrator
        .memory()
        .sessions()
        .list(DEFAULT_OWNER)
        .await
        .map_err(EngineError::storage)?;
    Ok(Json(sessions))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<SessionDetail>, ApiError> {
    let sessions = state.orchestrator.memory().sessions();
    let session = sessions
        .load(&id)
        .await
        .map_err(EngineError::storage)?
        .ok_or_else(|| EngineError::BadRequest(format!("unknown session: {id}")))?;
    let messages = sessions
        .messages(&id, query.view.unwrap_or(SessionView::Raw))
        .await
        .map_err(EngineError::storage)?;
    Ok(Json(SessionDetail { session, messages }))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state
        .orchestrator
        .memory()
        .sessions()
        .delete(&id)
        .await
        .map_err(EngineError::storage)?;
    if !deleted {
        return Err(EngineError::BadRequest(format!("unknown session: {id}")).into());
    }
    Ok(Json(serde_json::json!({ "status": "deleted", "id": id })))
}

async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let renamed = state
        .orchestrator
        .memory()
        .sessions()
        .rename(&id, &request.title)
        .await
        .map_err(EngineError::storage)?;
    if !renamed {
        return Err(EngineError::BadRequest(format!("unknown session: {id}")).into());
    }
    Ok(Json(serde_json::json!({ "status": "renamed", "id": id })))
}
