use std::sync::Arc;

use quorum_core::Orchestrator;

/// Shared application state accessible from all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub version: &'static str,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
