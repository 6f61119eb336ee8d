//! End-to-end orchestration tests against a scripted in-process model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio_stream::StreamExt;

use quorum_core::{
    default_registry, EngineConfig, EngineError, ModelGateway, Orchestrator, PromptStore,
};
use quorum_memory::{MemoryLayer, MemoryStore, SessionStore, StubEmbedder};
use quorum_provider::{ChatClient, ChatRequest, ChatResponse, ChunkStream, StreamChunk};
use quorum_schema::{AnswerRequest, Role, RoutingOverride, SessionView, StreamEvent};

const ENGINEER_REPLY: &str =
    "use a token bucket that refills tokens at a fixed rate and caps burst size";
const RESEARCHER_REPLY: &str =
    "published rate limiter comparisons favor token buckets over sliding windows";
const ETHICIST_REPLY: &str =
    "the design should cap burst size per tenant to protect fairness under load";

/// Routes scripted replies by prompt shape: classifier and decomposer
/// prompts get canned JSON, aggregator prompts get a synthesis, anything
/// else gets the persona reply for the system prompt in play.
struct ScriptedClient {
    routing: Mutex<String>,
    plan: Mutex<Option<String>>,
    routing_calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedClient {
    fn new(routing: &str) -> Self {
        Self {
            routing: Mutex::new(routing.to_string()),
            plan: Mutex::new(None),
            routing_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn with_plan(self, plan: &str) -> Self {
        *self.plan.lock().unwrap() = Some(plan.to_string());
        self
    }

    fn reply_for(&self, request: &ChatRequest) -> String {
        let user_text = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        if user_text.contains("route user queries") {
            self.routing_calls.fetch_add(1, Ordering::SeqCst);
            return self.routing.lock().unwrap().clone();
        }
        if user_text.contains("Break this query into") {
            return self
                .plan
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "no plan available".to_string());
        }
        if user_text.contains("Several specialist agents answered") {
            return format!("{ENGINEER_REPLY}. {ETHICIST_REPLY}.");
        }

        let system = request
            .messages
            .first()
            .filter(|m| m.role == "system")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if system.contains("engineering specialist") {
            ENGINEER_REPLY.to_string()
        } else if system.contains("research specialist") {
            RESEARCHER_REPLY.to_string()
        } else if system.contains("reasoning and ethics") {
            ETHICIST_REPLY.to_string()
        } else {
            format!("echo: {user_text}")
        }
    }
}

#[async_trait]
impl ChatClient for ScriptedClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(ChatResponse {
            text: self.reply_for(&request),
            stop_reason: Some("stop".into()),
            input_tokens: None,
            output_tokens: None,
        })
    }

    async fn stream(&self, request: ChatRequest) -> Result<ChunkStream> {
        self.requests.lock().unwrap().push(request.clone());
        let text = self.reply_for(&request);
        let mut chunks: Vec<Result<StreamChunk>> = text
            .split_whitespace()
            .map(|word| Ok(StreamChunk::delta(format!("{word} "))))
            .collect();
        chunks.push(Ok(StreamChunk::done(Some("stop".into()))));
        Ok(Box::pin(tokio_stream::iter(chunks)))
    }
}

struct DownClient;

#[async_trait]
impl ChatClient for DownClient {
    async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse> {
        anyhow::bail!("model api error (503): provider down")
    }
}

fn make_orchestrator(client: Arc<dyn ChatClient>) -> Arc<Orchestrator> {
    make_orchestrator_with(client, EngineConfig::default())
}

fn make_orchestrator_with(client: Arc<dyn ChatClient>, config: EngineConfig) -> Arc<Orchestrator> {
    let prompts = Arc::new(PromptStore::builtin());
    let gateway = Arc::new(ModelGateway::new(client));
    let registry = default_registry(prompts.clone(), gateway.clone(), &config);
    let embedder = Arc::new(StubEmbedder::new(8));
    let memory = MemoryLayer::new(
        Arc::new(MemoryStore::open_in_memory(8).unwrap()),
        Arc::new(SessionStore::open_in_memory().unwrap()),
        embedder,
    );
    Arc::new(Orchestrator::new(config, registry, memory, gateway, prompts))
}

fn single_routing(agent: &str) -> String {
    format!(r#"{{"agents": ["{agent}"], "strategy": "single", "rationale": "best fit"}}"#)
}

#[tokio::test]
async fn single_agent_direct() {
    let client = Arc::new(ScriptedClient::new(&single_routing("engineer")));
    let orch = make_orchestrator(client.clone());

    let response = orch
        .answer(AnswerRequest {
            query: "Explain TCP slow start".into(),
            session_id: Some("s1".into()),
            overrides: None,
        })
        .await
        .unwrap();

    assert_eq!(response.session_id, "s1");
    assert_eq!(response.content, ENGINEER_REPLY);
    assert!(!response.degraded);
    assert_eq!(response.contributors.len(), 1);
    assert_eq!(response.contributors[0].agent, "engineer");
    assert!(response.contributors[0].used);

    let messages = orch
        .memory()
        .sessions()
        .messages("s1", SessionView::Raw)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].agent.as_deref(), Some("engineer"));
}

#[tokio::test]
async fn collaborative_two_layer() {
    let routing = r#"{"agents": ["engineer", "ethicist"], "strategy": "collaborative", "rationale": "design then critique"}"#;
    let plan = r#"[
        {"id": 1, "agent": "engineer", "input": "design a rate limiter", "depends_on": []},
        {"id": 2, "agent": "ethicist", "input": "critique the design", "depends_on": [1]}
    ]"#;
    let client = Arc::new(ScriptedClient::new(routing).with_plan(plan));
    let orch = make_orchestrator(client.clone());

    let response = orch
        .answer(AnswerRequest {
            query: "Design and critique a rate limiter".into(),
            session_id: Some("s-collab".into()),
            overrides: None,
        })
        .await
        .unwrap();

    // Every dispatched agent appears exactly once, both used.
    let agents: Vec<&str> = response
        .contributors
        .iter()
        .map(|c| c.agent.as_str())
        .collect();
    assert_eq!(agents, vec!["engineer", "ethicist"]);
    assert!(response.contributors.iter().all(|c| c.used));

    // Stored log: user, engineer, ethicist, aggregator.
    let messages = orch
        .memory()
        .sessions()
        .messages("s-collab", SessionView::Raw)
        .await
        .unwrap();
    let attributions: Vec<Option<&str>> =
        messages.iter().map(|m| m.agent.as_deref()).collect();
    assert_eq!(
        attributions,
        vec![None, Some("engineer"), Some("ethicist"), Some("aggregator")]
    );

    // Presentation view collapses the run to the aggregator message.
    let presented = orch
        .memory()
        .sessions()
        .messages("s-collab", SessionView::Presentation)
        .await
        .unwrap();
    assert_eq!(presented.len(), 2);
    assert_eq!(presented[1].agent.as_deref(), Some("aggregator"));
}

#[tokio::test]
async fn override_bypasses_classifier() {
    let client = Arc::new(ScriptedClient::new(&single_routing("engineer")));
    let orch = make_orchestrator(client.clone());

    orch.set_override(RoutingOverride {
        agents: vec!["researcher".into()],
        force_single: true,
        force_all: false,
    })
    .unwrap();

    let response = orch
        .answer(AnswerRequest {
            query: "Write API docs".into(),
            session_id: Some("s2".into()),
            overrides: None,
        })
        .await
        .unwrap();

    assert_eq!(response.contributors.len(), 1);
    assert_eq!(response.contributors[0].agent, "researcher");
    assert_eq!(response.content, RESEARCHER_REPLY);
    assert_eq!(
        client.routing_calls.load(Ordering::SeqCst),
        0,
        "classifier must not run under an override"
    );

    // The override is one-shot: the next call classifies again.
    orch.answer(AnswerRequest {
        query: "Explain TCP slow start".into(),
        session_id: Some("s2".into()),
        overrides: None,
    })
    .await
    .unwrap();
    assert_eq!(client.routing_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_agent_in_override_is_rejected() {
    let client = Arc::new(ScriptedClient::new(&single_routing("engineer")));
    let orch = make_orchestrator(client);
    let err = orch
        .set_override(RoutingOverride {
            agents: vec!["writer".into()],
            force_single: true,
            force_all: false,
        })
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));
}

#[tokio::test]
async fn zero_agent_classification_falls_back() {
    let client = Arc::new(ScriptedClient::new(
        r#"{"agents": [], "strategy": "single", "rationale": "none fit"}"#,
    ));
    let orch = make_orchestrator(client);

    let response = orch
        .answer(AnswerRequest {
            query: "zzz qqq nothing matches".into(),
            session_id: Some("s3".into()),
            overrides: None,
        })
        .await
        .unwrap();

    assert!(response.degraded, "fallback runs surface as degraded");
    assert_eq!(response.contributors.len(), 1);
    assert_eq!(response.contributors[0].agent, "engineer");
}

#[tokio::test]
async fn cyclic_plan_falls_back_to_single() {
    let routing = r#"{"agents": ["engineer", "ethicist"], "strategy": "collaborative", "rationale": "r"}"#;
    let plan = r#"[
        {"id": 0, "agent": "engineer", "input": "a", "depends_on": [1]},
        {"id": 1, "agent": "ethicist", "input": "b", "depends_on": [0]}
    ]"#;
    let client = Arc::new(ScriptedClient::new(routing).with_plan(plan));
    let orch = make_orchestrator(client);

    let response = orch
        .answer(AnswerRequest {
            query: "Design and critique something".into(),
            session_id: Some("s4".into()),
            overrides: None,
        })
        .await
        .unwrap();

    assert!(response.degraded);
    assert_eq!(response.contributors.len(), 1);
    assert_eq!(response.contributors[0].agent, "engineer");
}

#[tokio::test]
async fn model_down_fails_request_but_keeps_user_message() {
    let orch = make_orchestrator(Arc::new(DownClient));

    let err = orch
        .answer(AnswerRequest {
            query: "anything".into(),
            session_id: Some("s5".into()),
            overrides: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ModelUnavailable(_)));

    let messages = orch
        .memory()
        .sessions()
        .messages("s5", SessionView::Raw)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1, "only the user message persists");
    assert_eq!(messages[0].role, Role::User);
}

#[tokio::test]
async fn failure_marker_is_appended_when_configured() {
    let config = EngineConfig {
        append_failure_marker: true,
        ..EngineConfig::default()
    };
    let orch = make_orchestrator_with(Arc::new(DownClient), config);

    let _ = orch
        .answer(AnswerRequest {
            query: "anything".into(),
            session_id: Some("s6".into()),
            overrides: None,
        })
        .await
        .unwrap_err();

    let messages = orch
        .memory()
        .sessions()
        .messages("s6", SessionView::Raw)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].content.contains("model_unavailable"));
}

#[tokio::test]
async fn gateway_payloads_always_alternate() {
    let client = Arc::new(ScriptedClient::new(&single_routing("engineer")));
    let orch = make_orchestrator(client.clone());

    // Two turns in one session: the second turn's history ends with an
    // assistant message block that the gateway must fold.
    for query in ["Explain TCP slow start", "Now explain congestion control"] {
        orch.answer(AnswerRequest {
            query: query.into(),
            session_id: Some("s7".into()),
            overrides: None,
        })
        .await
        .unwrap();
    }

    let requests = client.requests.lock().unwrap();
    assert!(requests.len() >= 2);
    for request in requests.iter() {
        let roles: Vec<&str> = request
            .messages
            .iter()
            .map(|m| m.role.as_str())
            .collect();
        let body = if roles.first() == Some(&"system") {
            &roles[1..]
        } else {
            &roles[..]
        };
        assert_eq!(body.first(), Some(&"user"), "payload starts with user");
        for pair in body.windows(2) {
            assert_ne!(pair[0], pair[1], "roles must strictly alternate: {roles:?}");
        }
    }
}

#[tokio::test]
async fn concurrent_answers_to_one_session_stay_contiguous() {
    let client = Arc::new(ScriptedClient::new(&single_routing("engineer")));
    let orch = make_orchestrator(client);

    let a = {
        let orch = orch.clone();
        tokio::spawn(async move {
            orch.answer(AnswerRequest {
                query: "first question".into(),
                session_id: Some("s8".into()),
                overrides: None,
            })
            .await
        })
    };
    let b = {
        let orch = orch.clone();
        tokio::spawn(async move {
            orch.answer(AnswerRequest {
                query: "second question".into(),
                session_id: Some("s8".into()),
                overrides: None,
            })
            .await
        })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let messages = orch
        .memory()
        .sessions()
        .messages("s8", SessionView::Raw)
        .await
        .unwrap();
    assert_eq!(messages.len(), 4);
    // Each run's user/assistant pair is contiguous, never interleaved.
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[2].role, Role::User);
    assert_eq!(messages[3].role, Role::Assistant);
}

#[tokio::test]
async fn streaming_happy_path_emits_progress_chunks_done() {
    let client = Arc::new(ScriptedClient::new(&single_routing("engineer")));
    let orch = make_orchestrator(client);

    let stream = orch.clone().answer_stream(AnswerRequest {
        query: "Explain TCP slow start".into(),
        session_id: Some("s9".into()),
        overrides: None,
    });
    let events: Vec<StreamEvent> = stream.collect().await;

    assert!(matches!(
        &events[0],
        StreamEvent::Progress { stage, .. } if stage == "classified"
    ));
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::Progress { stage, .. } if stage == "dispatched")));
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::Chunk { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, StreamEvent::AgentComplete { agent } if agent == "engineer")));
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Done { cancelled: false })
    ));

    let messages = orch
        .memory()
        .sessions()
        .messages("s9", SessionView::Raw)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].agent.as_deref(), Some("engineer"));
}

#[tokio::test]
async fn streaming_disconnect_persists_no_assistant_message() {
    let client = Arc::new(ScriptedClient::new(&single_routing("engineer")));
    let orch = make_orchestrator(client);

    {
        let stream = orch.clone().answer_stream(AnswerRequest {
            query: "Explain TCP slow start".into(),
            session_id: Some("s10".into()),
            overrides: None,
        });
        tokio::pin!(stream);
        // Consume only the first event, then hang up.
        let first = stream.next().await.unwrap();
        assert!(matches!(first, StreamEvent::Progress { .. }));
    }

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let messages = orch
        .memory()
        .sessions()
        .messages("s10", SessionView::Raw)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1, "only the user message survives a cancel");
    assert_eq!(messages[0].role, Role::User);
}

#[tokio::test]
async fn streaming_error_precedes_done() {
    let orch = make_orchestrator(Arc::new(DownClient));
    let stream = orch.clone().answer_stream(AnswerRequest {
        query: "anything".into(),
        session_id: Some("s11".into()),
        overrides: None,
    });
    let events: Vec<StreamEvent> = stream.collect().await;

    let error_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Error { .. }));
    let done_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Done { .. }));
    assert!(error_pos.is_some(), "error event expected: {events:?}");
    assert!(done_pos.unwrap() > error_pos.unwrap());
    assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
}

#[tokio::test]
async fn sessions_are_created_on_demand() {
    let client = Arc::new(ScriptedClient::new(&single_routing("engineer")));
    let orch = make_orchestrator(client);

    let response = orch
        .answer(AnswerRequest {
            query: "hello".into(),
            session_id: None,
            overrides: None,
        })
        .await
        .unwrap();

    assert!(!response.session_id.is_empty());
    let session = orch
        .memory()
        .sessions()
        .load(&response.session_id)
        .await
        .unwrap();
    assert!(session.is_some());
}

#[tokio::test]
async fn status_reports_dispatch_counters() {
    let client = Arc::new(ScriptedClient::new(&single_routing("engineer")));
    let orch = make_orchestrator(client);

    for _ in 0..3 {
        orch.answer(AnswerRequest {
            query: "Explain TCP slow start".into(),
            session_id: Some("s12".into()),
            overrides: None,
        })
        .await
        .unwrap();
    }

    let status = orch.status().await.unwrap();
    let engineer = status
        .agents
        .iter()
        .find(|a| a.name == "engineer")
        .unwrap();
    assert_eq!(engineer.dispatches, 3);
    assert!(status.memory.vectors >= 3, "write-back enriches memory");
}

#[tokio::test]
async fn empty_query_is_bad_request() {
    let client = Arc::new(ScriptedClient::new(&single_routing("engineer")));
    let orch = make_orchestrator(client);
    let err = orch
        .answer(AnswerRequest {
            query: "   ".into(),
            session_id: None,
            overrides: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));
}
