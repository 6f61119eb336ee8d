//! Route-level tests driving the router with tower's oneshot.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use quorum_core::{default_registry, EngineConfig, ModelGateway, Orchestrator, PromptStore};
use quorum_memory::{MemoryLayer, MemoryStore, SessionStore, StubEmbedder};
use quorum_provider::{ChatClient, ChatRequest, ChatResponse};
use quorum_schema::{DocumentRecord, MemoryRecord};
use quorum_server::state::AppState;

const AGENT_REPLY: &str = "slow start doubles the congestion window every round trip";

/// Classifier prompts get a canned single-agent decision; everything else
/// gets the agent reply.
struct ScriptedClient;

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        let user_text = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let text = if user_text.contains("route user queries") {
            r#"{"agents": ["engineer"], "strategy": "single", "rationale": "systems"}"#.to_string()
        } else {
            AGENT_REPLY.to_string()
        };
        Ok(ChatResponse {
            text,
            stop_reason: Some("stop".into()),
            input_tokens: None,
            output_tokens: None,
        })
    }
}

fn make_app() -> (Router, AppState) {
    let config = EngineConfig::default();
    let prompts = Arc::new(PromptStore::builtin());
    let gateway = Arc::new(ModelGateway::new(Arc::new(ScriptedClient)));
    let registry = default_registry(prompts.clone(), gateway.clone(), &config);
    let memory = MemoryLayer::new(
        Arc::new(MemoryStore::open_in_memory(8).unwrap()),
        Arc::new(SessionStore::open_in_memory().unwrap()),
        Arc::new(StubEmbedder::new(8)),
    );
    let orchestrator = Arc::new(Orchestrator::new(config, registry, memory, gateway, prompts));
    let state = AppState::new(orchestrator);
    (quorum_server::create_router(state.clone()), state)
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn answer_roundtrip() {
    let (app, _) = make_app();
    let response = app
        .oneshot(json_request(
            "POST",
            "/answer",
            serde_json::json!({"query": "Explain TCP slow start", "session_id": "s1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["session_id"], "s1");
    assert_eq!(body["content"], AGENT_REPLY);
    assert_eq!(body["contributors"][0]["agent"], "engineer");
    assert_eq!(body["contributors"][0]["used"], true);
    assert!(body["duration_ms"].is_number());
}

#[tokio::test]
async fn empty_query_maps_to_400() {
    let (app, _) = make_app();
    let response = app
        .oneshot(json_request(
            "POST",
            "/answer",
            serde_json::json!({"query": "  "}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["code"], "bad_request");
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn health_lists_agents() {
    let (app, _) = make_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["agents"].as_array().unwrap().len(), 3);
    assert_eq!(body["agents"][0]["name"], "engineer");
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let (app, _) = make_app();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/sessions",
            serde_json::json!({"title": "networking"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = body_json(response).await["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/answer",
            serde_json::json!({"query": "Explain TCP slow start", "session_id": session_id}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/sessions")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let sessions = body_json(response).await;
    assert_eq!(sessions.as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/sessions/{session_id}?view=raw"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let detail = body_json(response).await;
    assert_eq!(detail["session"]["title"], "networking");
    assert_eq!(detail["messages"].as_array().unwrap().len(), 2);

    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            &format!("/sessions/{session_id}"),
            serde_json::json!({"title": "renamed"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/sessions/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/sessions/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn control_override_routes_next_answer() {
    let (app, _) = make_app();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/control/agent/override",
            serde_json::json!({
                "query": "Write API docs",
                "agents": ["researcher"],
                "force_single": true,
                "force_all": false
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(json_request(
            "POST",
            "/answer",
            serde_json::json!({"query": "Write API docs", "session_id": "s2"}),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["contributors"][0]["agent"], "researcher");
    assert_eq!(body["contributors"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn override_with_unknown_agent_is_rejected() {
    let (app, _) = make_app();
    let response = app
        .oneshot(json_request(
            "POST",
            "/control/agent/override",
            serde_json::json!({"agents": ["writer"], "force_single": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn memory_filter_removes_matching_records_and_messages() {
    let (app, state) = make_app();
    let memory = state.orchestrator.memory();

    memory
        .store(MemoryRecord::Document(DocumentRecord {
            id: uuid::Uuid::new_v4(),
            text: "test message artifact".into(),
            metadata: Default::default(),
        }))
        .await
        .unwrap();
    let session = memory.sessions().create("default", None).await.unwrap();
    memory
        .sessions()
        .append(&quorum_schema::Message::user(
            &session.id,
            "error generating response",
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/control/memory/manage",
            serde_json::json!({
                "operation": "filter",
                "filters": {"patterns": ["test message", "error generating"]}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["removed"]["documents"], 1);
    assert_eq!(body["removed"]["messages"], 1);

    let remaining = memory.recent_conversation(&session.id, 10).await.unwrap();
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn memory_export_import_over_http() {
    let (app, state) = make_app();
    state
        .orchestrator
        .memory()
        .store(MemoryRecord::Document(DocumentRecord {
            id: uuid::Uuid::new_v4(),
            text: "durable".into(),
            metadata: Default::default(),
        }))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/control/memory/manage",
            serde_json::json!({"operation": "export"}),
        ))
        .await
        .unwrap();
    let snapshot = body_json(response).await;
    assert_eq!(snapshot["documents"].as_array().unwrap().len(), 1);

    // A fresh app imports the snapshot.
    let (app2, state2) = make_app();
    let response = app2
        .oneshot(json_request(
            "POST",
            "/control/memory/manage",
            serde_json::json!({"operation": "import", "data": snapshot}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let sizes = state2.orchestrator.memory().sizes().await.unwrap();
    assert_eq!(sizes.documents, 1);
}

#[tokio::test]
async fn routing_config_and_status() {
    let (app, _) = make_app();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/control/routing/config",
            serde_json::json!({
                "enable_collaboration": false,
                "enable_multi_agent": true,
                "routing_strategy": "keyword"
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/control/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = body_json(response).await;
    assert_eq!(status["routing"]["routing_strategy"], "keyword");
    assert_eq!(status["routing"]["enable_collaboration"], false);
    assert_eq!(status["agents"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn answer_stream_emits_ndjson_ending_with_done() {
    let (app, _) = make_app();
    let response = app
        .oneshot(json_request(
            "POST",
            "/answer/stream",
            serde_json::json!({"query": "Explain TCP slow start", "session_id": "s3"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-ndjson"
    );

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert!(lines.len() >= 3);
    assert_eq!(lines[0]["type"], "progress");
    assert_eq!(lines[0]["data"]["stage"], "classified");
    assert!(lines.iter().any(|l| l["type"] == "chunk"));
    assert_eq!(lines.last().unwrap()["type"], "done");
}
