//! Model catalogue — `GET /models`, `/v1/models`, `/models/{id}`,
//! `/v1/models/{id}`. OpenAI-shaped, sourced from the `LlmRouter`'s
//! provider registry rather than the teacher's flat `{providers, count}`
//! body (grounded on the shape, not the payload, of the teacher's
//! `api/providers.rs`).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use crate::state::AppState;

pub async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let data: Vec<_> = state
        .llm_router
        .registry()
        .list_providers()
        .into_iter()
        .map(|id| model_object(&id))
        .collect();

    Json(json!({
        "object": "list",
        "data": data,
    }))
}

pub async fn get_model(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.llm_router.registry().list_providers().contains(&id) {
        Json(model_object(&id)).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "message": format!("unknown model '{id}'"), "type": "invalid_request_error" } })),
        )
            .into_response()
    }
}

fn model_object(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "object": "model",
        "owned_by": "red-ai",
    })
}
