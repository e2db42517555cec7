//! `ra-stream` — the per-turn streaming pipeline: owns
//! `MessageGenerationState` on the Bus, fans out content/thinking/tool
//! events to `message:stream:<messageId>`, runs the ready handshake
//! before an expensive generation starts, and replays state to a
//! reconnecting SSE subscriber.
//!
//! Grounded on the same buffer-drain-yield shape as
//! `ra_providers::sse` — a small stateful struct wrapped by an
//! `async_stream::stream!` generator — adapted here for the Bus
//! channel instead of an HTTP response body.

mod think;

pub use think::{ThinkOutput, ThinkTagParser};

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use chrono::Utc;
use ra_bus::Bus;
use ra_domain::model::{MessageGenerationState, StreamStatus, ToolEvent};
use ra_domain::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const STATE_TTL: Duration = Duration::from_secs(60 * 60);
const READY_TTL: Duration = Duration::from_secs(60);
const SUBSCRIBER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bus key helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn state_key(message_id: &str) -> String {
    format!("message:generating:{message_id}")
}

fn stream_channel(message_id: &str) -> String {
    format!("message:stream:{message_id}")
}

pub fn tool_event_channel(message_id: &str) -> String {
    format!("tool:event:{message_id}")
}

fn ready_key(message_id: &str) -> String {
    format!("stream:ready:{message_id}")
}

fn conversation_generating_key(conversation_id: &str) -> String {
    format!("conversation:generating:{conversation_id}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wire frames
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One frame on `message:stream:<messageId>` (or replayed synthetically
/// by [`subscribe_to_message`] on reconnect).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamFrame {
    #[serde(rename = "init")]
    Init { existing_content: String },
    #[serde(rename = "chunk")]
    Chunk {
        content: String,
        #[serde(default, skip_serializing_if = "is_false")]
        thinking: bool,
    },
    #[serde(rename = "tool_event")]
    ToolEvent { event: ToolEvent },
    #[serde(rename = "status")]
    Status { action: String, description: String },
    #[serde(rename = "tool_status")]
    ToolStatus { status: String, action: String },
    #[serde(rename = "thinkingComplete")]
    ThinkingComplete,
    #[serde(rename = "complete")]
    Complete { metadata: Value },
    #[serde(rename = "error")]
    Error { error: String },
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamFrame::Complete { .. } | StreamFrame::Error { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("no generation state found for message {0}")]
    NoState(String),
    #[error(transparent)]
    Bus(#[from] ra_domain::error::Error),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StreamPublisher — the sole mutator of MessageGenerationState
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Owns one turn's `MessageGenerationState` and publishes every update
/// both into the persisted state and onto the live fan-out channel.
pub struct StreamPublisher {
    bus: Arc<dyn Bus>,
    message_id: String,
    conversation_id: String,
    parser: ThinkTagParser,
}

impl StreamPublisher {
    /// Create and persist a fresh `generating` state for this turn.
    pub async fn start(bus: Arc<dyn Bus>, conversation_id: &str, message_id: &str) -> Self {
        let state = MessageGenerationState::new(conversation_id, message_id);
        let mut publisher = Self {
            bus,
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            parser: ThinkTagParser::new(),
        };
        publisher.persist(&state).await;
        if let Err(error) = publisher
            .bus
            .sadd(&conversation_generating_key(conversation_id), message_id)
            .await
        {
            tracing::warn!(%error, "failed to register conversation as generating");
        }
        publisher
    }

    /// Wait for the SSE consumer to mark itself ready, up to
    /// `StreamConfig.ready_handshake_timeout_secs`. On timeout, proceeds
    /// anyway — the caller must not block generation indefinitely on an
    /// absent client.
    pub async fn await_ready_handshake(&self, timeout: Duration) {
        let key = ready_key(&self.message_id);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.bus.get(&key).await {
                Ok(Some(_)) => return,
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(%error, "failed to poll ready handshake key");
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::debug!(message_id = %self.message_id, "ready handshake timed out, proceeding");
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Feed one raw token chunk from the LLM through the `<think>`
    /// parser, publishing whatever content/thinking text it resolves.
    pub async fn push_token(&mut self, raw: &str) {
        let output = self.parser.feed(raw);
        self.emit_think_output(output).await;
    }

    /// Flush any text still buffered in the `<think>` parser. Call once
    /// before completing the turn.
    pub async fn finish_tokens(&mut self) {
        let output = self.parser.finish();
        self.emit_think_output(output).await;
    }

    async fn emit_think_output(&mut self, output: ThinkOutput) {
        if !output.thinking.is_empty() {
            self.append_thinking(&output.thinking).await;
            self.publish(&StreamFrame::Chunk {
                content: output.thinking,
                thinking: true,
            })
            .await;
        }
        if !output.content.is_empty() {
            self.append_content(&output.content).await;
            self.publish(&StreamFrame::Chunk {
                content: output.content,
                thinking: false,
            })
            .await;
        }
    }

    pub async fn push_tool_event(&mut self, event: ToolEvent) {
        if let Ok(Some(raw)) = self.bus.get(&state_key(&self.message_id)).await {
            if let Ok(mut state) = serde_json::from_str::<MessageGenerationState>(&raw) {
                state.tool_events.push(event.clone());
                self.persist(&state).await;
            }
        }
        self.publish(&StreamFrame::ToolEvent { event }).await;
    }

    pub async fn push_status(&mut self, action: impl Into<String>, description: impl Into<String>) {
        let frame = StreamFrame::Status {
            action: action.into(),
            description: description.into(),
        };
        self.set_current_status(&frame).await;
        self.publish(&frame).await;
    }

    pub async fn push_tool_status(&mut self, status: impl Into<String>, action: impl Into<String>) {
        let frame = StreamFrame::ToolStatus {
            status: status.into(),
            action: action.into(),
        };
        self.set_current_status(&frame).await;
        self.publish(&frame).await;
    }

    pub async fn push_thinking_complete(&self) {
        self.publish(&StreamFrame::ThinkingComplete).await;
    }

    /// Mark the turn complete, terminal in both the persisted state and
    /// the live channel.
    pub async fn complete(&self, metadata: Value) {
        self.mutate(|state| state.metadata = Some(metadata.clone())).await;
        self.transition(StreamStatus::Completed, None).await;
        self.publish(&StreamFrame::Complete { metadata }).await;
        self.deregister().await;
    }

    /// Mark the turn failed.
    pub async fn fail(&self, error: impl Into<String>) {
        let error = error.into();
        self.transition(StreamStatus::Error, Some(error.clone())).await;
        self.publish(&StreamFrame::Error { error }).await;
        self.deregister().await;
    }

    async fn deregister(&self) {
        if let Err(error) = self
            .bus
            .srem(&conversation_generating_key(&self.conversation_id), &self.message_id)
            .await
        {
            tracing::warn!(%error, "failed to deregister generating message");
        }
    }

    async fn append_content(&self, text: &str) {
        self.mutate(|state| state.content.push_str(text)).await;
    }

    async fn append_thinking(&self, text: &str) {
        self.mutate(|state| state.thinking.push_str(text)).await;
    }

    async fn set_current_status(&self, frame: &StreamFrame) {
        if let Ok(value) = serde_json::to_value(frame) {
            self.mutate(|state| state.current_status = Some(value.clone()))
                .await;
        }
    }

    async fn transition(&self, status: StreamStatus, error: Option<String>) {
        self.mutate(|state| {
            state.status = status;
            state.completed_at = Some(Utc::now());
            state.error = error.clone();
        })
        .await;
    }

    async fn mutate(&self, f: impl FnOnce(&mut MessageGenerationState)) {
        let key = state_key(&self.message_id);
        match self.bus.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<MessageGenerationState>(&raw) {
                Ok(mut state) => {
                    f(&mut state);
                    self.persist(&state).await;
                }
                Err(error) => tracing::warn!(%error, "failed to parse generation state"),
            },
            Ok(None) => tracing::warn!(message_id = %self.message_id, "generation state missing during mutate"),
            Err(error) => tracing::warn!(%error, "failed to read generation state"),
        }
    }

    async fn persist(&self, state: &MessageGenerationState) {
        match serde_json::to_string(state) {
            Ok(payload) => {
                if let Err(error) = self
                    .bus
                    .set(&state_key(&self.message_id), &payload, Some(STATE_TTL))
                    .await
                {
                    tracing::warn!(%error, "failed to persist generation state");
                }
            }
            Err(error) => tracing::warn!(%error, "failed to serialize generation state"),
        }
    }

    async fn publish(&self, frame: &StreamFrame) {
        match serde_json::to_string(frame) {
            Ok(payload) => {
                if let Err(error) = self.bus.publish(&stream_channel(&self.message_id), &payload).await {
                    tracing::warn!(%error, "failed to publish stream frame");
                }
            }
            Err(error) => tracing::warn!(%error, "failed to serialize stream frame"),
        }
    }
}

/// Called by the SSE consumer (or any reconnecting client) once it's
/// actually listening, unblocking [`StreamPublisher::await_ready_handshake`]
/// early.
pub async fn mark_stream_ready(bus: &dyn Bus, message_id: &str) -> Result<(), ra_domain::error::Error> {
    bus.set(&ready_key(message_id), "1", Some(READY_TTL)).await
}

/// Reconnect/replay entry point: yields the turn's already-accumulated
/// content (if any), the latest status indicator (if any), then either
/// the terminal frame (if the turn already finished) or a live forward
/// of `message:stream:<messageId>` until `complete`/`error`/idle
/// timeout.
pub fn subscribe_to_message(
    bus: Arc<dyn Bus>,
    message_id: String,
) -> BoxStream<'static, Result<StreamFrame, StreamError>> {
    let stream = stream! {
        let key = state_key(&message_id);
        let raw = match bus.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                yield Err(StreamError::NoState(message_id.clone()));
                return;
            }
            Err(error) => {
                yield Err(StreamError::Bus(error));
                return;
            }
        };
        let state: MessageGenerationState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(error) => {
                yield Err(StreamError::Bus(ra_domain::error::Error::Json(error)));
                return;
            }
        };

        if !state.content.is_empty() {
            yield Ok(StreamFrame::Init { existing_content: state.content.clone() });
        }

        if let Some(current_status) = state.current_status.clone() {
            if let Ok(frame) = serde_json::from_value::<StreamFrame>(current_status) {
                yield Ok(frame);
            }
        }

        if state.is_terminal() {
            match state.status {
                StreamStatus::Completed => {
                    yield Ok(StreamFrame::Complete { metadata: state.metadata.clone().unwrap_or(Value::Null) });
                }
                StreamStatus::Error => {
                    yield Ok(StreamFrame::Error { error: state.error.clone().unwrap_or_default() });
                }
                StreamStatus::Generating => unreachable!("is_terminal() excludes Generating"),
            }
            return;
        }

        let mut subscription = match bus.subscribe(&stream_channel(&message_id)).await {
            Ok(s) => s,
            Err(error) => {
                yield Err(StreamError::Bus(error));
                return;
            }
        };

        loop {
            match tokio::time::timeout(SUBSCRIBER_IDLE_TIMEOUT, futures_util::StreamExt::next(&mut subscription)).await {
                Ok(Some(raw)) => {
                    match serde_json::from_str::<StreamFrame>(&raw) {
                        Ok(frame) => {
                            let terminal = frame.is_terminal();
                            yield Ok(frame);
                            if terminal {
                                return;
                            }
                        }
                        Err(error) => {
                            tracing::warn!(%error, "failed to parse stream frame, skipping");
                        }
                    }
                }
                Ok(None) => return,
                Err(_elapsed) => {
                    // Idle for 30s: recheck whether the turn finished
                    // without us seeing the terminal frame (e.g. we
                    // connected between publish and our subscribe).
                    match bus.get(&key).await {
                        Ok(Some(raw)) => {
                            if let Ok(state) = serde_json::from_str::<MessageGenerationState>(&raw) {
                                if state.is_terminal() {
                                    match state.status {
                                        StreamStatus::Completed => {
                                            yield Ok(StreamFrame::Complete { metadata: state.metadata.unwrap_or(Value::Null) });
                                        }
                                        StreamStatus::Error => {
                                            yield Ok(StreamFrame::Error { error: state.error.unwrap_or_default() });
                                        }
                                        StreamStatus::Generating => {}
                                    }
                                    return;
                                }
                            }
                        }
                        _ => return,
                    }
                }
            }
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use ra_bus::InMemoryBus;
    use ra_domain::model::ToolExecutionStatus;

    fn bus() -> Arc<dyn Bus> {
        Arc::new(InMemoryBus::new())
    }

    #[tokio::test]
    async fn start_persists_generating_state() {
        let bus = bus();
        let publisher = StreamPublisher::start(bus.clone(), "conv-1", "msg-1").await;
        let raw = bus.get(&state_key(&publisher.message_id)).await.unwrap().unwrap();
        let state: MessageGenerationState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.status, StreamStatus::Generating);
        assert!(state.content.is_empty());
    }

    #[tokio::test]
    async fn push_token_accumulates_content_and_publishes_chunk() {
        let bus = bus();
        let mut publisher = StreamPublisher::start(bus.clone(), "conv-1", "msg-2").await;
        let mut subscription = bus.subscribe(&stream_channel("msg-2")).await.unwrap();

        publisher.push_token("hello").await;
        let frame: StreamFrame = serde_json::from_str(&subscription.next().await.unwrap()).unwrap();
        match frame {
            StreamFrame::Chunk { content, thinking } => {
                assert_eq!(content, "hello");
                assert!(!thinking);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let raw = bus.get(&state_key("msg-2")).await.unwrap().unwrap();
        let state: MessageGenerationState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.content, "hello");
    }

    #[tokio::test]
    async fn push_token_routes_think_tags_to_thinking_chunks() {
        let bus = bus();
        let mut publisher = StreamPublisher::start(bus.clone(), "conv-1", "msg-3").await;
        let mut subscription = bus.subscribe(&stream_channel("msg-3")).await.unwrap();

        publisher.push_token("<think>reasoning</think>answer").await;
        let frame: StreamFrame = serde_json::from_str(&subscription.next().await.unwrap()).unwrap();
        match frame {
            StreamFrame::Chunk { content, thinking } => {
                assert_eq!(content, "reasoning");
                assert!(thinking);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        let frame: StreamFrame = serde_json::from_str(&subscription.next().await.unwrap()).unwrap();
        match frame {
            StreamFrame::Chunk { content, thinking } => {
                assert_eq!(content, " answer");
                assert!(!thinking);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn complete_marks_state_terminal_and_deregisters() {
        let bus = bus();
        let publisher = StreamPublisher::start(bus.clone(), "conv-1", "msg-4").await;
        publisher.complete(serde_json::json!({"ok": true})).await;

        let raw = bus.get(&state_key("msg-4")).await.unwrap().unwrap();
        let state: MessageGenerationState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.status, StreamStatus::Completed);
        assert!(state.is_terminal());

        let members = bus.smembers(&conversation_generating_key("conv-1")).await.unwrap();
        assert!(!members.contains(&"msg-4".to_string()));
    }

    #[tokio::test]
    async fn subscribe_to_message_without_state_errors() {
        let bus = bus();
        let mut stream = subscribe_to_message(bus, "nonexistent".to_string());
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(StreamError::NoState(_))));
    }

    #[tokio::test]
    async fn subscribe_to_message_replays_existing_content_then_forwards() {
        let bus = bus();
        let mut publisher = StreamPublisher::start(bus.clone(), "conv-1", "msg-5").await;
        publisher.push_token("partial").await;

        let mut stream = subscribe_to_message(bus.clone(), "msg-5".to_string());
        let init = stream.next().await.unwrap().unwrap();
        match init {
            StreamFrame::Init { existing_content } => assert_eq!(existing_content, "partial"),
            other => panic!("expected init, got {other:?}"),
        }

        publisher.push_token(" more").await;
        let forwarded = stream.next().await.unwrap().unwrap();
        match forwarded {
            StreamFrame::Chunk { content, .. } => assert_eq!(content, " more"),
            other => panic!("expected chunk, got {other:?}"),
        }

        publisher.complete(Value::Null).await;
        let terminal = stream.next().await.unwrap().unwrap();
        assert!(terminal.is_terminal());
    }

    #[tokio::test]
    async fn subscribe_to_message_on_already_terminal_state_yields_complete_and_ends() {
        let bus = bus();
        let publisher = StreamPublisher::start(bus.clone(), "conv-1", "msg-6").await;
        publisher.complete(serde_json::json!({"done": true})).await;

        let mut stream = subscribe_to_message(bus, "msg-6".to_string());
        let frame = stream.next().await.unwrap().unwrap();
        assert!(frame.is_terminal());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn complete_metadata_survives_replay_after_reconnect() {
        let bus = bus();
        let publisher = StreamPublisher::start(bus.clone(), "conv-1", "msg-10").await;
        publisher.complete(serde_json::json!({"usage": {"total_tokens": 42}})).await;

        let mut stream = subscribe_to_message(bus, "msg-10".to_string());
        let frame = stream.next().await.unwrap().unwrap();
        match frame {
            StreamFrame::Complete { metadata } => {
                assert_eq!(metadata["usage"]["total_tokens"], 42);
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn push_tool_event_appends_to_state_and_publishes() {
        let bus = bus();
        let mut publisher = StreamPublisher::start(bus.clone(), "conv-1", "msg-7").await;
        let mut subscription = bus.subscribe(&stream_channel("msg-7")).await.unwrap();

        publisher
            .push_tool_event(ToolEvent::ToolStart {
                tool_id: "t1".into(),
                tool_type: "web_search".into(),
                tool_name: "web_search".into(),
                timestamp: Utc::now(),
                metadata: Value::Null,
            })
            .await;

        let frame: StreamFrame = serde_json::from_str(&subscription.next().await.unwrap()).unwrap();
        assert!(matches!(frame, StreamFrame::ToolEvent { .. }));

        let raw = bus.get(&state_key("msg-7")).await.unwrap().unwrap();
        let state: MessageGenerationState = serde_json::from_str(&raw).unwrap();
        assert_eq!(state.tool_events.len(), 1);
        let _ = ToolExecutionStatus::Running;
    }

    #[tokio::test]
    async fn ready_handshake_unblocks_immediately_once_marked() {
        let bus = bus();
        let publisher = StreamPublisher::start(bus.clone(), "conv-1", "msg-8").await;
        mark_stream_ready(bus.as_ref(), "msg-8").await.unwrap();
        let start = tokio::time::Instant::now();
        publisher.await_ready_handshake(Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_handshake_times_out_and_proceeds() {
        let bus = bus();
        let publisher = StreamPublisher::start(bus.clone(), "conv-1", "msg-9").await;
        let waiting = tokio::spawn(async move {
            publisher.await_ready_handshake(Duration::from_secs(5)).await;
        });
        tokio::time::advance(Duration::from_secs(6)).await;
        waiting.await.unwrap();
    }
}
