pub mod auth;
pub mod chat;
pub mod health;
pub mod models;

use axum::middleware;
use axum::routing::get;
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes split into **public** (no auth required — liveness/info) and
/// **protected** (gated behind the bearer-token middleware): grounded on
/// the teacher's `api/mod.rs` public/protected split, trimmed to the
/// routes this gateway's spec actually names.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/", get(health::root))
        .route("/v1", get(health::v1_info));

    let protected = Router::new()
        .route("/chat/completions", axum::routing::post(chat::chat_completions))
        .route("/v1/chat/completions", axum::routing::post(chat::chat_completions))
        .route("/models", get(models::list_models))
        .route("/v1/models", get(models::list_models))
        .route("/models/:id", get(models::get_model))
        .route("/v1/models/:id", get(models::get_model))
        .route_layer(middleware::from_fn_with_state(state, auth::require_api_token));

    public
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
