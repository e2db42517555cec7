use serde::Serialize;

/// Structured trace events emitted across the `ra-*` crates, distinct
/// from `LogEntry`: these are operator-facing diagnostics, not
/// conversation-scoped data the Logger persists and replays to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    GenerationStarted {
        conversation_id: String,
        generation_id: String,
    },
    GenerationFinished {
        generation_id: String,
        status: String,
        duration_ms: u64,
    },
    ProviderCall {
        provider: String,
        model: String,
        streaming: bool,
        duration_ms: u64,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
    ToolCall {
        tool_name: String,
        duration_ms: u64,
        is_error: bool,
    },
    BusOpFailed {
        op: String,
        reason: String,
    },
    StoreWriteFailed {
        collection: String,
        reason: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "ra_event");
    }
}
