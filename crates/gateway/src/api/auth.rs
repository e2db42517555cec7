//! Bearer-token gate. Grounded on the teacher's `api/auth.rs`: constant-time
//! comparison against a hash computed once at startup, with a dev-mode
//! bypass when no token is configured.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

fn error_body(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        axum::Json(serde_json::json!({ "error": { "code": code, "message": message } })),
    )
        .into_response()
}

/// `/health` and `OPTIONS` requests are exempt; everything else requires a
/// matching `Authorization: Bearer <token>` header once an API token is
/// configured. In dev mode (no token configured) every request is accepted.
pub async fn require_api_token(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return next.run(req).await;
    }

    let Some(expected_hash) = &state.api_token_hash else {
        return next.run(req).await;
    };

    let Some(provided) = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    else {
        return error_body(StatusCode::UNAUTHORIZED, "missing_api_key", "missing Authorization bearer token");
    };

    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(expected_hash.as_slice())) {
        return error_body(StatusCode::FORBIDDEN, "invalid_api_key", "invalid API token");
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::get;
    use axum::Router;
    use ra_bus::{Bus, InMemoryBus};
    use ra_domain::config::{
        AuthConfig, AuthMode, GenerationConfig, LlmConfig, MemoryConfig, ProviderConfig, ProviderKind,
    };
    use ra_engine::Engine;
    use ra_generation::GenerationRegistry;
    use ra_logger::BusLogger;
    use ra_memory::MemoryManager;
    use ra_providers::LlmRouter;
    use ra_store::JsonlStore;
    use ra_tools::ToolRegistry;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn state_with_token(token: Option<&str>) -> (AppState, tempfile::TempDir) {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn ra_store::DurableStore> = Arc::new(JsonlStore::new(dir.path()).unwrap());
        let memory = Arc::new(MemoryManager::new(bus.clone(), store.clone(), MemoryConfig {
            max_context_tokens: 30_000,
            summary_cushion_tokens: 2_000,
            hot_cache_cap: 100,
        }));
        let generation = Arc::new(GenerationRegistry::new(bus.clone(), store.clone(), GenerationConfig::default()));
        let logger: Arc<dyn ra_logger::Logger> = Arc::new(BusLogger::new(bus.clone(), 3600));
        let tools = Arc::new(ToolRegistry::empty(bus.clone()));
        let router = Arc::new(
            LlmRouter::from_config(&LlmConfig {
                providers: vec![ProviderConfig {
                    id: "p".into(),
                    kind: ProviderKind::OpenaiCompat,
                    base_url: "https://api.example.com/v1".into(),
                    auth: AuthConfig { mode: AuthMode::None, ..AuthConfig::default() },
                    default_model: None,
                }],
                ..LlmConfig::default()
            })
            .unwrap(),
        );
        let engine = Arc::new(Engine::new(
            bus.clone(),
            store,
            memory,
            generation,
            logger,
            router.clone(),
            tools,
            ra_domain::config::GraphConfig::default(),
            ra_domain::config::StreamConfig::default(),
            None,
        ));
        let state = AppState {
            config: Arc::new(crate::config::GatewayConfig::default()),
            engine,
            bus,
            llm_router: router,
            api_token_hash: token.map(|t| Sha256::digest(t.as_bytes()).to_vec()),
        };
        (state, dir)
    }

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/protected", get(|| async { "ok" }))
            .route_layer(axum::middleware::from_fn_with_state(state.clone(), require_api_token))
            .with_state(state)
    }

    #[tokio::test]
    async fn dev_mode_accepts_unauthenticated_requests() {
        let (state, _dir) = state_with_token(None);
        let response = app(state)
            .oneshot(Request::builder().uri("/protected").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let (state, _dir) = state_with_token(Some("secret"));
        let response = app(state)
            .oneshot(Request::builder().uri("/protected").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn mismatched_token_is_forbidden() {
        let (state, _dir) = state_with_token(Some("secret"));
        let response = app(state)
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn matching_token_is_accepted() {
        let (state, _dir) = state_with_token(Some("secret"));
        let response = app(state)
            .oneshot(
                Request::builder()
                    .uri("/protected")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
