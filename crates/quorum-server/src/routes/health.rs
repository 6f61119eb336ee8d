use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(get_health))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: String,
    agents: Vec<AgentHealth>,
}

#[derive(Serialize)]
struct AgentHealth {
    name: String,
    ready: bool,
}

async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let ready = state.orchestrator.gateway_ready().await;
    let agents = state
        .orchestrator
        .registry()
        .names()
        .into_iter()
        .map(|name| AgentHealth { name, ready })
        .collect();
    Json(HealthResponse {
        status: if ready { "ok" } else { "degraded" },
        version: state.version.to_string(),
        agents,
    })
}
