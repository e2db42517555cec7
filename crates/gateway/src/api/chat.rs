//! OpenAI-compatible `/chat/completions` and `/v1/chat/completions`.
//!
//! Grounded on the teacher's `api/openai_compat.rs` — same request/response
//! shapes, same blocking-vs-streaming split — but wired to this project's
//! `ra_engine::Engine::respond()`, which hands back a `TurnHandle` the
//! instant a turn is accepted rather than a channel of `TurnEvent`s. Both
//! the blocking and streaming paths subscribe to the turn's message via
//! `ra_stream::subscribe_to_message` and differ only in whether they drain
//! it to completion before responding or forward each frame as an SSE
//! chunk.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ra_engine::{EngineError, RespondOptions};
use ra_stream::StreamFrame;

use crate::state::AppState;

const CONVERSATION_ID_HEADER: &str = "x-conversation-id";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatCompletionMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionMessage {
    pub role: String,
    pub content: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionChoice {
    index: u32,
    message: ChatCompletionResponseMessage,
    finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionResponseMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionChunk {
    id: String,
    object: &'static str,
    created: i64,
    model: String,
    choices: Vec<ChatCompletionChunkChoice>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionChunkChoice {
    index: u32,
    delta: ChatCompletionChunkDelta,
    finish_reason: Option<&'static str>,
}

#[derive(Debug, Default, Serialize)]
struct ChatCompletionChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    /// Set only on chunks whose source tokens came from a `<think>` block —
    /// never present alongside `content`, never folded into the final
    /// response's `message.content`.
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<bool>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionRequest>,
) -> Response {
    let conversation_id = headers
        .get(CONVERSATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let query = match extract_last_user_message(&body.messages) {
        Some(query) => query,
        None => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "no user message found in messages array",
            )
        }
    };

    let model = body.model.clone();

    if body.stream {
        chat_completions_stream(state, conversation_id, query, model).await
    } else {
        chat_completions_blocking(state, conversation_id, query, model).await
    }
}

fn extract_last_user_message(messages: &[ChatCompletionMessage]) -> Option<String> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.clone())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Non-streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn chat_completions_blocking(
    state: AppState,
    conversation_id: Option<String>,
    query: String,
    model: String,
) -> Response {
    let handle = match state
        .engine
        .respond(&query, RespondOptions { conversation_id, system_prompt: None })
        .await
    {
        Ok(handle) => handle,
        Err(EngineError::GenerationInProgress) => return generation_in_progress_response(),
        Err(error) => {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "server_error", &error.to_string())
        }
    };

    if let Err(error) = ra_stream::mark_stream_ready(state.bus.as_ref(), &handle.message_id).await {
        tracing::warn!(%error, "failed to mark blocking stream ready");
    }

    let mut frames = ra_stream::subscribe_to_message(state.bus.clone(), handle.message_id.clone());
    let mut content = String::new();
    let mut turn_error = None;

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(StreamFrame::Init { existing_content }) => content.push_str(&existing_content),
            Ok(StreamFrame::Chunk { content: text, thinking: false }) => content.push_str(&text),
            Ok(StreamFrame::Chunk { thinking: true, .. }) => {}
            Ok(StreamFrame::Complete { .. }) => break,
            Ok(StreamFrame::Error { error }) => {
                turn_error = Some(error);
                break;
            }
            Ok(_) => {}
            Err(error) => {
                turn_error = Some(error.to_string());
                break;
            }
        }
    }

    if let Some(message) = turn_error {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "server_error", &message);
    }

    let response = ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion",
        created: Utc::now().timestamp(),
        model,
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ChatCompletionResponseMessage { role: "assistant", content },
            finish_reason: "stop",
        }],
    };

    Json(response).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn chat_completions_stream(
    state: AppState,
    conversation_id: Option<String>,
    query: String,
    model: String,
) -> Response {
    let handle = match state
        .engine
        .respond(&query, RespondOptions { conversation_id, system_prompt: None })
        .await
    {
        Ok(handle) => handle,
        Err(EngineError::GenerationInProgress) => {
            return sse_of_single_error(generation_in_progress_message()).into_response()
        }
        Err(error) => return sse_of_single_error(error.to_string()).into_response(),
    };

    if let Err(error) = ra_stream::mark_stream_ready(state.bus.as_ref(), &handle.message_id).await {
        tracing::warn!(%error, "failed to mark streaming stream ready");
    }

    let completion_id = format!("chatcmpl-{}", Uuid::new_v4());
    let created = Utc::now().timestamp();
    let bus = state.bus.clone();
    let message_id = handle.message_id.clone();

    let stream = async_stream::stream! {
        yield Ok::<_, std::convert::Infallible>(
            Event::default().data(serde_json::to_string(&ChatCompletionChunk {
                id: completion_id.clone(),
                object: "chat.completion.chunk",
                created,
                model: model.clone(),
                choices: vec![ChatCompletionChunkChoice {
                    index: 0,
                    delta: ChatCompletionChunkDelta { role: Some("assistant"), ..Default::default() },
                    finish_reason: None,
                }],
            }).unwrap_or_default())
        );

        let mut frames = ra_stream::subscribe_to_message(bus, message_id);
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(StreamFrame::Init { existing_content }) if !existing_content.is_empty() => {
                    yield Ok(chunk_event(&completion_id, created, &model, Some(existing_content), None, None));
                }
                Ok(StreamFrame::Chunk { content, thinking }) => {
                    if thinking {
                        yield Ok(chunk_event(&completion_id, created, &model, None, Some(true), None));
                    } else {
                        yield Ok(chunk_event(&completion_id, created, &model, Some(content), None, None));
                    }
                }
                Ok(StreamFrame::Complete { .. }) => {
                    yield Ok(chunk_event(&completion_id, created, &model, None, None, Some("stop")));
                    yield Ok(Event::default().data("[DONE]"));
                    return;
                }
                Ok(StreamFrame::Error { error }) => {
                    yield Ok(Event::default().data(
                        serde_json::json!({ "error": { "message": error, "type": "server_error" } }).to_string()
                    ));
                    yield Ok(Event::default().data("[DONE]"));
                    return;
                }
                Ok(_) => {}
                Err(error) => {
                    yield Ok(Event::default().data(
                        serde_json::json!({ "error": { "message": error.to_string(), "type": "server_error" } }).to_string()
                    ));
                    yield Ok(Event::default().data("[DONE]"));
                    return;
                }
            }
        }
        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

fn chunk_event(
    id: &str,
    created: i64,
    model: &str,
    content: Option<String>,
    thinking: Option<bool>,
    finish_reason: Option<&'static str>,
) -> Event {
    let payload = ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk",
        created,
        model: model.to_string(),
        choices: vec![ChatCompletionChunkChoice {
            index: 0,
            delta: ChatCompletionChunkDelta { role: None, content, thinking },
            finish_reason,
        }],
    };
    Event::default().data(serde_json::to_string(&payload).unwrap_or_default())
}

fn sse_of_single_error(message: String) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let event = Event::default().data(
        serde_json::json!({ "error": { "message": message, "type": "server_error" } }).to_string(),
    );
    let stream = futures_util::stream::iter(vec![
        Ok(event),
        Ok(Event::default().data("[DONE]")),
    ]);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared error shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The literal substring the concurrent-generation testable property
/// requires in the 500 body — `EngineError::GenerationInProgress`'s own
/// `Display` text reads differently, so this is spelled out here rather
/// than forwarded from `error.to_string()`.
fn generation_in_progress_message() -> String {
    "a generation is already in progress for this conversation".to_string()
}

fn generation_in_progress_response() -> Response {
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "server_error", &generation_in_progress_message())
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": { "message": message, "type": kind } })),
    )
        .into_response()
}
