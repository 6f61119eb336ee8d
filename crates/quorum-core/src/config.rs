use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// All engine knobs as one flat struct, read from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model_base_url: String,
    pub model_api_key: String,
    pub model_id: String,
    pub model_max_tokens: u32,
    pub model_temperature: f32,

    pub embedding_base_url: String,
    pub embedding_api_key: String,
    pub embedding_model_id: String,
    pub embedding_dimension: usize,

    /// sqlite path, or ":memory:".
    pub session_store_url: String,
    pub memory_store_url: String,

    pub request_timeout: Duration,
    pub agent_timeout: Duration,
    pub classifier_timeout: Duration,
    /// Ceiling on concurrent model calls; defaults to the agent count.
    pub max_concurrent_agents: Option<usize>,

    pub bind_addr: String,
    /// Optional directory of template overrides (one file per template).
    pub prompt_dir: Option<PathBuf>,
    /// Append an assistant failure marker when a whole request fails.
    pub append_failure_marker: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_base_url: "http://localhost:11434/v1".into(),
            model_api_key: String::new(),
            model_id: "llama3".into(),
            model_max_tokens: 1024,
            model_temperature: 0.7,
            embedding_base_url: "http://localhost:11434/v1".into(),
            embedding_api_key: String::new(),
            embedding_model_id: "nomic-embed-text".into(),
            embedding_dimension: 768,
            session_store_url: ":memory:".into(),
            memory_store_url: ":memory:".into(),
            request_timeout: Duration::from_secs(60),
            agent_timeout: Duration::from_secs(30),
            classifier_timeout: Duration::from_secs(10),
            max_concurrent_agents: None,
            bind_addr: "127.0.0.1:8700".into(),
            prompt_dir: None,
            append_failure_marker: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("MODEL_BASE_URL") {
            config.model_base_url = v;
        }
        if let Ok(v) = std::env::var("MODEL_API_KEY") {
            config.model_api_key = v;
        }
        if let Ok(v) = std::env::var("MODEL_ID") {
            config.model_id = v;
        }
        if let Ok(v) = std::env::var("MODEL_MAX_TOKENS") {
            config.model_max_tokens = parse_var("MODEL_MAX_TOKENS", &v)?;
        }
        if let Ok(v) = std::env::var("MODEL_TEMPERATURE") {
            config.model_temperature = parse_var("MODEL_TEMPERATURE", &v)?;
        }
        if let Ok(v) = std::env::var("EMBEDDING_BASE_URL") {
            config.embedding_base_url = v;
        }
        if let Ok(v) = std::env::var("EMBEDDING_API_KEY") {
            config.embedding_api_key = v;
        }
        if let Ok(v) = std::env::var("EMBEDDING_MODEL_ID") {
            config.embedding_model_id = v;
        }
        if let Ok(v) = std::env::var("EMBEDDING_DIMENSION") {
            config.embedding_dimension = parse_var("EMBEDDING_DIMENSION", &v)?;
        }
        if let Ok(v) = std::env::var("SESSION_STORE_URL") {
            config.session_store_url = v;
        }
        if let Ok(v) = std::env::var("MEMORY_STORE_URL") {
            config.memory_store_url = v;
        }
        if let Ok(v) = std::env::var("REQUEST_TIMEOUT_S") {
            config.request_timeout = Duration::from_secs(parse_var("REQUEST_TIMEOUT_S", &v)?);
        }
        if let Ok(v) = std::env::var("AGENT_TIMEOUT_S") {
            config.agent_timeout = Duration::from_secs(parse_var("AGENT_TIMEOUT_S", &v)?);
        }
        if let Ok(v) = std::env::var("CLASSIFIER_TIMEOUT_S") {
            config.classifier_timeout = Duration::from_secs(parse_var("CLASSIFIER_TIMEOUT_S", &v)?);
        }
        if let Ok(v) = std::env::var("MAX_CONCURRENT_AGENTS") {
            config.max_concurrent_agents = Some(parse_var("MAX_CONCURRENT_AGENTS", &v)?);
        }
        if let Ok(v) = std::env::var("BIND_ADDR") {
            config.bind_addr = v;
        }
        if let Ok(v) = std::env::var("PROMPT_DIR") {
            config.prompt_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("APPEND_FAILURE_MARKER") {
            config.append_failure_marker = v == "1" || v.eq_ignore_ascii_case("true");
        }

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> EngineResult<T> {
    raw.parse()
        .map_err(|_| EngineError::BadRequest(format!("invalid value for {name}: {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = EngineConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.agent_timeout, Duration::from_secs(30));
        assert_eq!(config.classifier_timeout, Duration::from_secs(10));
        assert!(!config.append_failure_marker);
        assert!(config.max_concurrent_agents.is_none());
    }

    #[test]
    fn parse_var_rejects_garbage() {
        let err = parse_var::<u32>("MODEL_MAX_TOKENS", "lots").unwrap_err();
        assert!(matches!(err, EngineError::BadRequest(_)));
        assert!(err.to_string().contains("MODEL_MAX_TOKENS"));
    }

    #[test]
    fn parse_var_accepts_numbers() {
        let v: usize = parse_var("EMBEDDING_DIMENSION", "1536").unwrap();
        assert_eq!(v, 1536);
    }
}
