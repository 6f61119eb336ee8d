//! Named prompt templates with strict `{var}` interpolation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::error::{EngineError, EngineResult};

pub const CLASSIFIER_SELECTION: &str = "classifier.selection";
pub const DECOMPOSER_PLAN: &str = "decomposer.plan";
pub const AGGREGATOR_SYNTHESIZE: &str = "aggregator.synthesize";

/// Template id for an agent's system prompt.
pub fn agent_system_template(agent: &str) -> String {
    format!("agent.{agent}.system")
}

const BUILTIN_TEMPLATES: &[(&str, &str)] = &[
    (
        CLASSIFIER_SELECTION,
        r#"You route user queries to specialist agents.

Available agents and their capabilities:
{agents}

Recent conversation:
{history}

Query: {query}

Pick the agent(s) best suited to answer and a strategy:
- "single": one agent answers alone
- "parallel": several agents answer independently
- "collaborative": agents build on each other's output

Respond with only a JSON object, no prose:
{"agents": ["name"], "strategy": "single", "rationale": "why"}"#,
    ),
    (
        DECOMPOSER_PLAN,
        r#"Break this query into a short sequence of tasks for specialist agents.

Available agents:
{agents}

Query: {query}

Rules: at most {max_tasks} tasks, each assigned to exactly one agent by
name. "depends_on" lists the ids of tasks whose output the task needs.
Dependencies must not form a cycle.

Respond with only a JSON array, no prose:
[{"id": 0, "agent": "name", "input": "what to do", "depends_on": []}]"#,
    ),
    (
        "agent.engineer.system",
        "You are the engineering specialist. You design and explain software \
systems, protocols, algorithms and infrastructure. Be concrete: name the \
mechanism, state the trade-off, give the numbers when they matter. Prefer \
working designs over surveys of options.",
    ),
    (
        "agent.researcher.system",
        "You are the research specialist. You retrieve, compare and summarize \
information relevant to the query. Cite what you rely on from the provided \
context, distinguish established facts from inference, and say plainly when \
the context does not cover the question.",
    ),
    (
        "agent.ethicist.system",
        "You are the reasoning and ethics specialist. You critique proposals, \
surface risks, edge cases and second-order effects, and weigh competing \
interests. Be specific about failure modes; a critique without a concrete \
scenario is not useful.",
    ),
    (
        AGGREGATOR_SYNTHESIZE,
        r#"Several specialist agents answered the same query. Synthesize their
outputs into one coherent reply.

Query: {query}

Agent outputs:
{outputs}

Merge overlapping points, resolve contradictions in favor of the more
specific claim, and keep the strongest material from each agent. Write the
final reply only, no meta-commentary about the agents."#,
    ),
];

/// Keyed template store. Built-ins can be overridden from a directory at
/// load time or replaced at runtime through the control surface; templates
/// are otherwise read-only.
pub struct PromptStore {
    templates: RwLock<HashMap<String, String>>,
}

impl PromptStore {
    pub fn builtin() -> Self {
        let templates = BUILTIN_TEMPLATES
            .iter()
            .map(|(name, body)| (name.to_string(), body.to_string()))
            .collect();
        Self {
            templates: RwLock::new(templates),
        }
    }

    /// Builtin templates plus overrides from `dir` (file stem = template
    /// name, e.g. `agent.engineer.system.txt`).
    pub fn with_dir(dir: &Path) -> EngineResult<Self> {
        let store = Self::builtin();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                return Err(EngineError::BadRequest(format!(
                    "prompt dir {} unreadable: {e}",
                    dir.display()
                )))
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let body = std::fs::read_to_string(&path)
                .map_err(|e| EngineError::Storage(format!("read {}: {e}", path.display())))?;
            store.insert(name, body.trim_end().to_string());
        }
        Ok(store)
    }

    pub fn insert(&self, name: &str, body: String) {
        self.templates
            .write()
            .expect("prompt store lock poisoned")
            .insert(name.to_string(), body);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates
            .read()
            .expect("prompt store lock poisoned")
            .contains_key(name)
    }

    /// Render a template. Unknown template or a placeholder left without a
    /// value fails the render.
    pub fn render(&self, name: &str, vars: &[(&str, &str)]) -> EngineResult<String> {
        let template = {
            let templates = self.templates.read().expect("prompt store lock poisoned");
            templates
                .get(name)
                .cloned()
                .ok_or_else(|| {
                    EngineError::BadRequest(format!("prompt render failed: unknown template {name}"))
                })?
        };

        // Placeholders are collected from the template before substitution
        // so braces inside substituted values cannot fail the render.
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template.as_str();
        while let Some((before, placeholder, after)) = next_placeholder(rest) {
            rendered.push_str(before);
            match vars.iter().find(|(key, _)| *key == placeholder) {
                Some((_, value)) => rendered.push_str(value),
                None => {
                    return Err(EngineError::BadRequest(format!(
                        "prompt render failed: missing variable {{{placeholder}}} in template {name}"
                    )))
                }
            }
            rest = after;
        }
        rendered.push_str(rest);
        Ok(rendered)
    }
}

/// Split `text` at its first `{lower_snake}` placeholder. JSON braces in
/// template bodies do not match because the character right after `{` is a
/// quote or brace.
fn next_placeholder(text: &str) -> Option<(&str, &str, &str)> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len()
                && (bytes[end].is_ascii_lowercase()
                    || bytes[end].is_ascii_digit()
                    || bytes[end] == b'_')
            {
                end += 1;
            }
            if end > start && end < bytes.len() && bytes[end] == b'}' {
                return Some((&text[..i], &text[start..end], &text[end + 1..]));
            }
        }
        i += 1;
    }
    None
}
