use std::sync::Arc;

use ra_engine::Engine;
use ra_providers::LlmRouter;

use crate::config::GatewayConfig;

/// Shared application state passed to every API handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub engine: Arc<Engine>,
    pub bus: Arc<dyn ra_bus::Bus>,
    /// Held separately from `engine` so `/models` and friends can list
    /// providers/roles without the engine needing to expose its router.
    pub llm_router: Arc<LlmRouter>,
    /// SHA-256 hash of the API bearer token, read once at startup.
    /// `None` means dev mode: unauthenticated requests are accepted.
    pub api_token_hash: Option<Vec<u8>>,
}

impl AppState {
    pub fn engine_provider_count(&self) -> usize {
        self.llm_router.registry().len()
    }
}
