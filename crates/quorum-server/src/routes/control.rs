use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use quorum_core::{AgentConfigKind, EngineError, RoutingConfig, StatusReport};
use quorum_memory::{ClearOutcome, Snapshot};
use quorum_schema::{MemoryKind, RoutingOverride};

use super::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/agent/override", post(set_override))
        .route("/agent/config", post(set_agent_config))
        .route("/routing/config", post(set_routing_config))
        .route("/memory/manage", post(manage_memory))
        .route("/status", get(get_status))
}

#[derive(Deserialize)]
struct OverrideRequest {
    /// The query this override is meant for; recorded, not matched.
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    agents: Vec<String>,
    #[serde(default)]
    force_single: bool,
    #[serde(default)]
    force_all: bool,
}

async fn set_override(
    State(state): State<AppState>,
    Json(request): Json<OverrideRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if let Some(query) = &request.query {
        tracing::info!(agents = ?request.agents, %query, "routing override installed");
    }
    state.orchestrator.set_override(RoutingOverride {
        agents: request.agents,
        force_single: request.force_single,
        force_all: request.force_all,
    })?;
    Ok(Json(serde_json::json!({ "status": "override_set" })))
}

#[derive(Deserialize)]
struct AgentConfigRequest {
    agent_name: String,
    config_type: AgentConfigKind,
    config_data: serde_json::Value,
    #[serde(default)]
    persist: bool,
}

async fn set_agent_config(
    State(state): State<AppState>,
    Json(request): Json<AgentConfigRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.orchestrator.update_agent_config(
        &request.agent_name,
        request.config_type,
        request.config_data,
        request.persist,
    )?;
    Ok(Json(serde_json::json!({ "status": "updated", "agent": request.agent_name })))
}

async fn set_routing_config(
    State(state): State<AppState>,
    Json(config): Json<RoutingConfig>,
) -> Json<serde_json::Value> {
    state.orchestrator.set_routing_config(config);
    Json(serde_json::json!({ "status": "updated" }))
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum MemoryOperation {
    Clear,
    Filter,
    Export,
    Import,
}

#[derive(Default, Deserialize)]
struct MemoryFilters {
    #[serde(default)]
    kind: Option<MemoryKind>,
    #[serde(default)]
    patterns: Vec<String>,
}

#[derive(Deserialize)]
struct MemoryManageRequest {
    operation: MemoryOperation,
    #[serde(default)]
    filters: Option<MemoryFilters>,
    #[serde(default)]
    data: Option<Snapshot>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MemoryManageResponse {
    Removed { removed: ClearOutcome },
    Exported(Box<Snapshot>),
    Imported { status: &'static str },
}

async fn manage_memory(
    State(state): State<AppState>,
    Json(request): Json<MemoryManageRequest>,
) -> Result<Json<MemoryManageResponse>, ApiError> {
    let memory = state.orchestrator.memory();
    let response = match request.operation {
        MemoryOperation::Clear => {
            let filters = request.filters.unwrap_or_default();
            let removed = memory
                .clear(filters.kind, &[])
                .await
                .map_err(EngineError::storage)?;
            MemoryManageResponse::Removed { removed }
        }
        MemoryOperation::Filter => {
            let filters = request.filters.unwrap_or_default();
            if filters.patterns.is_empty() {
                return Err(
                    EngineError::BadRequest("filter requires at least one pattern".into()).into(),
                );
            }
            let removed = memory
                .clear(filters.kind, &filters.patterns)
                .await
                .map_err(EngineError::storage)?;
            MemoryManageResponse::Removed { removed }
        }
        MemoryOperation::Export => {
            let snapshot = memory.export().await.map_err(EngineError::storage)?;
            MemoryManageResponse::Exported(Box::new(snapshot))
        }
        MemoryOperation::Import => {
            let snapshot = request.data.ok_or_else(|| {
                EngineError::BadRequest("import requires a snapshot in data".into())
            })?;
            memory
                .import(snapshot)
                .await
                .map_err(|e| EngineError::BadRequest(e.to_string()))?;
            MemoryManageResponse::Imported { status: "imported" }
        }
    };
    Ok(Json(response))
}

async fn get_status(State(state): State<AppState>) -> Result<Json<StatusReport>, ApiError> {
    let report = state.orchestrator.status().await?;
    Ok(Json(report))
}
