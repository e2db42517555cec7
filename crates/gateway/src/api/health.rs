//! Liveness/info endpoints. Exempt from the bearer-token gate.

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "Red AI API" }))
}

pub async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "Red AI API",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": state.engine_provider_count(),
    }))
}

pub async fn v1_info(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "object": "api_info",
        "version": "v1",
        "providers": state.engine_provider_count(),
    }))
}
