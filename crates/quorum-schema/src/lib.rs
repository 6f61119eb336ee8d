use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One entry in a session's append-only message log.
///
/// `agent` is set only on assistant messages and names the specialist that
/// produced the text ("aggregator" for synthesized output).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            role: Role::User,
            content: content.into(),
            agent: None,
            confidence: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(
        session_id: impl Into<String>,
        agent: impl Into<String>,
        content: impl Into<String>,
        confidence: f32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            role: Role::Assistant,
            content: content.into(),
            agent: Some(agent.into()),
            confidence: Some(confidence),
            created_at: Utc::now(),
        }
    }
}

/// A conversation session. `messages` are stored separately and append-only;
/// `updated_at` tracks the last append.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// How a session log is presented to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionView {
    /// Every message with full per-agent attribution.
    Raw,
    /// Each multi-agent run collapsed to its aggregator message.
    Presentation,
}

/// Static description of a registered agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub prompt_template_id: String,
    pub active: bool,
}

/// How the selected agents are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Single,
    Parallel,
    Collaborative,
}

/// Output of the classifier (or an override, or the keyword fallback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub agents: Vec<String>,
    pub strategy: Strategy,
    pub rationale: String,
    /// Set when the classifier output was unparseable and the keyword
    /// fallback produced this decision.
    #[serde(default)]
    pub degraded: bool,
}

/// One unit in a collaborative task graph, assigned to a single agent.
/// Nodes are arena-owned and addressed by index; `depends_on` holds indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: usize,
    pub agent: String,
    pub input: String,
    #[serde(default)]
    pub depends_on: Vec<usize>,
    #[serde(default)]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    pub nodes: Vec<TaskNode>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A memory search hit included in agent prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub text: String,
    pub score: f64,
    pub kind: MemoryKind,
}

/// Which backing store a memory record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Vector,
    Document,
    Relational,
}

/// Vector-store record. The embedding dimension is fixed when the store is
/// initialized; inserts with another dimension are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: Uuid,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub importance: f32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Subject/predicate/object triplet expressing an entity fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationRecord {
    pub id: Uuid,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum MemoryRecord {
    Vector(VectorRecord),
    Document(DocumentRecord),
    Relational(RelationRecord),
}

impl MemoryRecord {
    pub fn kind(&self) -> MemoryKind {
        match self {
            MemoryRecord::Vector(_) => MemoryKind::Vector,
            MemoryRecord::Document(_) => MemoryKind::Document,
            MemoryRecord::Relational(_) => MemoryKind::Relational,
        }
    }
}

/// Per-request working set threaded through classifier, executor and
/// aggregator.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub query: String,
    pub session_id: String,
    pub history: Vec<Message>,
    pub memory_hits: Vec<MemoryHit>,
    pub routing: Option<RoutingDecision>,
    pub task_graph: Option<TaskGraph>,
    /// Completed task outputs, keyed by node id. A node never executes
    /// before all of its `depends_on` entries are present here.
    pub partial_outputs: BTreeMap<usize, String>,
}

/// What one agent produced for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentReply {
    pub agent: String,
    pub content: String,
    pub confidence: f32,
}

/// Attribution entry on an aggregated response. `used` records whether the
/// synthesized text meaningfully incorporated this agent's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contributor {
    pub agent: String,
    pub confidence: f32,
    pub used: bool,
}

/// One-shot routing override installed via the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingOverride {
    pub agents: Vec<String>,
    #[serde(default)]
    pub force_single: bool,
    #[serde(default)]
    pub force_all: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub query: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub overrides: Option<RoutingOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub content: String,
    pub contributors: Vec<Contributor>,
    pub session_id: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub degraded: bool,
}

/// Events emitted on the streaming answer path. Serialized one JSON object
/// per line as `{"type": ..., "data": ...}`; the final event is always
/// `done`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk {
        content: String,
    },
    Progress {
        stage: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
    },
    AgentComplete {
        agent: String,
    },
    Error {
        code: String,
        message: String,
    },
    Done {
        #[serde(default)]
        cancelled: bool,
    },
}

/// Per-request lifecycle states, used for tracing and progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    Classified,
    Decomposed,
    Dispatched,
    Aggregating,
    Persisted,
    Done,
    Failed,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_helpers_populate_attribution() {
        let user = Message::user("s1", "hello");
        assert_eq!(user.role, Role::User);
        assert!(user.agent.is_none());
        assert!(user.confidence.is_none());

        let reply = Message::assistant("s1", "engineer", "hi", 0.9);
        assert_eq!(reply.role, Role::Assistant);
        assert_eq!(reply.agent.as_deref(), Some("engineer"));
        assert_eq!(reply.confidence, Some(0.9));
    }

    #[test]
    fn message_serde_roundtrip() {
        let msg = Message::assistant("s1", "aggregator", "combined", 0.8);
        let json = serde_json::to_string(&msg).unwrap();
        let de: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(de.id, msg.id);
        assert_eq!(de.agent.as_deref(), Some("aggregator"));
        assert_eq!(de.content, "combined");
    }

    #[test]
    fn message_backward_compat_optional_fields() {
        let old_json = r#"{
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "session_id": "s1",
            "role": "user",
            "content": "hello",
            "created_at": "2026-02-12T10:00:00Z"
        }"#;
        let msg: Message = serde_json::from_str(old_json).unwrap();
        assert!(msg.agent.is_none());
        assert!(msg.confidence.is_none());
    }

    #[test]
    fn strategy_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Strategy::Collaborative).unwrap(),
            "\"collaborative\""
        );
        let s: Strategy = serde_json::from_str("\"single\"").unwrap();
        assert_eq!(s, Strategy::Single);
    }

    #[test]
    fn routing_decision_degraded_defaults_false() {
        let json = r#"{"agents":["engineer"],"strategy":"single","rationale":"test"}"#;
        let decision: RoutingDecision = serde_json::from_str(json).unwrap();
        assert!(!decision.degraded);
        assert_eq!(decision.agents, vec!["engineer"]);
    }

    #[test]
    fn task_node_depends_on_defaults_empty() {
        let json = r#"{"id":0,"agent":"engineer","input":"design it"}"#;
        let node: TaskNode = serde_json::from_str(json).unwrap();
        assert!(node.depends_on.is_empty());
        assert!(node.output.is_none());
    }

    #[test]
    fn stream_event_wire_shape() {
        let chunk = StreamEvent::Chunk {
            content: "partial".into(),
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "chunk");
        assert_eq!(json["data"]["content"], "partial");

        let progress = StreamEvent::Progress {
            stage: "classified".into(),
            agent: None,
        };
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["data"]["stage"], "classified");
        assert!(json["data"].get("agent").is_none());

        let done = StreamEvent::Done { cancelled: false };
        let json = serde_json::to_value(&done).unwrap();
        assert_eq!(json["type"], "done");
    }

    #[test]
    fn stream_event_agent_complete_roundtrip() {
        let event = StreamEvent::AgentComplete {
            agent: "researcher".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let de: StreamEvent = serde_json::from_str(&json).unwrap();
        match de {
            StreamEvent::AgentComplete { agent } => assert_eq!(agent, "researcher"),
            _ => panic!("expected AgentComplete variant"),
        }
    }

    #[test]
    fn memory_record_kind_matches_variant() {
        let rec = MemoryRecord::Relational(RelationRecord {
            id: Uuid::new_v4(),
            subject: "rust".into(),
            predicate: "is".into(),
            object: "fast".into(),
            confidence: 0.9,
        });
        assert_eq!(rec.kind(), MemoryKind::Relational);

        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["kind"], "relational");
    }

    #[test]
    fn answer_request_optional_fields_default() {
        let req: AnswerRequest = serde_json::from_str(r#"{"query":"hi"}"#).unwrap();
        assert!(req.session_id.is_none());
        assert!(req.overrides.is_none());
    }

    #[test]
    fn session_view_parses() {
        let raw: SessionView = serde_json::from_str("\"raw\"").unwrap();
        assert_eq!(raw, SessionView::Raw);
        let pres: SessionView = serde_json::from_str("\"presentation\"").unwrap();
        assert_eq!(pres, SessionView::Presentation);
    }
}
