use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use quorum_core::{default_registry, EngineConfig, ModelGateway, Orchestrator, PromptStore};
use quorum_memory::{
    EmbeddingProvider, MemoryLayer, MemoryStore, OpenAiEmbeddingClient, SessionStore, StubEmbedder,
};
use quorum_provider::{ChatClient, OpenAiCompatClient, StubClient};
use quorum_server::state::AppState;

#[derive(Parser)]
#[command(name = "quorum", about = "Multi-agent query orchestrator", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve {
        /// Bind address, overrides BIND_ADDR.
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print the resolved configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::from_env()?;

    match cli.command {
        Command::Serve { bind } => {
            let addr = bind.unwrap_or_else(|| config.bind_addr.clone());
            let state = build_state(config)?;
            quorum_server::serve(state, &addr).await
        }
        Command::CheckConfig => {
            println!("model:      {} @ {}", config.model_id, config.model_base_url);
            println!(
                "embedding:  {} @ {} ({} dims)",
                config.embedding_model_id, config.embedding_base_url, config.embedding_dimension
            );
            println!("sessions:   {}", config.session_store_url);
            println!("memory:     {}", config.memory_store_url);
            println!(
                "timeouts:   request {:?}, agent {:?}, classifier {:?}",
                config.request_timeout, config.agent_timeout, config.classifier_timeout
            );
            println!("bind:       {}", config.bind_addr);
            Ok(())
        }
    }
}

/// Construct the process-wide stack in dependency order: stores, gateway,
/// registry, orchestrator. Teardown is the reverse drop order.
fn build_state(config: EngineConfig) -> Result<AppState> {
    let client: Arc<dyn ChatClient> = if std::env::var("MODEL_BASE_URL").is_ok() {
        Arc::new(OpenAiCompatClient::new(
            config.model_api_key.clone(),
            config.model_base_url.clone(),
        ))
    } else {
        tracing::warn!("MODEL_BASE_URL unset, serving with the stub model");
        Arc::new(StubClient)
    };

    let embedder: Arc<dyn EmbeddingProvider> = if std::env::var("EMBEDDING_BASE_URL").is_ok() {
        Arc::new(OpenAiEmbeddingClient::new(
            config.embedding_api_key.clone(),
            config.embedding_base_url.clone(),
            config.embedding_model_id.clone(),
            config.embedding_dimension,
        ))
    } else {
        tracing::warn!("EMBEDDING_BASE_URL unset, using the deterministic stub embedder");
        Arc::new(StubEmbedder::new(config.embedding_dimension))
    };

    let memory_store = if config.memory_store_url == ":memory:" {
        MemoryStore::open_in_memory(config.embedding_dimension)?
    } else {
        MemoryStore::open(&config.memory_store_url, config.embedding_dimension)?
    };
    let session_store = if config.session_store_url == ":memory:" {
        SessionStore::open_in_memory()?
    } else {
        SessionStore::open(&config.session_store_url)?
    };
    let memory = MemoryLayer::new(Arc::new(memory_store), Arc::new(session_store), embedder);

    let prompts = match &config.prompt_dir {
        Some(dir) => Arc::new(PromptStore::with_dir(dir)?),
        None => Arc::new(PromptStore::builtin()),
    };
    let gateway = Arc::new(ModelGateway::new(client));
    let registry = default_registry(prompts.clone(), gateway.clone(), &config);

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        registry,
        memory,
        gateway,
        prompts,
    ));
    Ok(AppState::new(orchestrator))
}
