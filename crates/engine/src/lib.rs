//! `ra-engine` — the orchestrator that wires the Bus, Durable Store,
//! Memory Manager, Generation Registry, Tool Registry, Stream Pipeline,
//! and planner/executor graph into a single `respond()` call. Grounded
//! on the teacher's `src/api` handlers, which likewise sit on top of
//! every other subsystem without owning any storage of their own —
//! this crate is the same kind of thin composition root.

use std::sync::Arc;

use chrono::Utc;
use ra_background::{
    get_active_nodes, get_conversation_metadata, put_conversation_metadata, run_heartbeat,
    should_generate_title, title_generation_task, trailing_summary_task, executive_summary_task,
};
use ra_bus::Bus;
use ra_domain::config::{GraphConfig, StreamConfig};
use ra_domain::error::Error;
use ra_domain::model::Message;
use ra_domain::tool::Role;
use ra_generation::{CompleteGenerationParams, GenerationRegistry};
use ra_graph::{GraphRuntime, GraphState};
use ra_logger::Logger;
use ra_memory::MemoryManager;
use ra_providers::LlmRouter;
use ra_store::DurableStore;
use ra_stream::StreamPublisher;
use ra_tools::ToolRegistry;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("a generation is already in flight for this conversation")]
    GenerationInProgress,
    #[error(transparent)]
    Graph(#[from] ra_graph::GraphError),
    #[error(transparent)]
    Other(#[from] Error),
}

/// Caller-supplied knobs for one `respond()` call.
#[derive(Debug, Clone, Default)]
pub struct RespondOptions {
    /// An existing conversation to continue; a fresh id is derived from
    /// the query text when absent.
    pub conversation_id: Option<String>,
    /// Overrides the default system prompt for this turn.
    pub system_prompt: Option<String>,
}

/// Identifiers assigned to a turn the instant it's accepted — callers
/// use `message_id` to subscribe via [`ra_stream::subscribe_to_message`]
/// for both the streaming and non-streaming HTTP paths.
#[derive(Debug, Clone)]
pub struct TurnHandle {
    pub conversation_id: String,
    pub message_id: String,
    pub generation_id: String,
}

/// Binds every runtime collaborator a turn needs. One `Engine` is
/// shared (via `Arc`) across every inbound request.
pub struct Engine {
    bus: Arc<dyn Bus>,
    store: Arc<dyn DurableStore>,
    memory: Arc<MemoryManager>,
    generation: Arc<GenerationRegistry>,
    logger: Arc<dyn Logger>,
    router: Arc<LlmRouter>,
    tools: Arc<ToolRegistry>,
    graph_config: GraphConfig,
    stream_config: StreamConfig,
    default_system_prompt: Option<String>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<dyn Bus>,
        store: Arc<dyn DurableStore>,
        memory: Arc<MemoryManager>,
        generation: Arc<GenerationRegistry>,
        logger: Arc<dyn Logger>,
        router: Arc<LlmRouter>,
        tools: Arc<ToolRegistry>,
        graph_config: GraphConfig,
        stream_config: StreamConfig,
        default_system_prompt: Option<String>,
    ) -> Self {
        Self {
            bus,
            store,
            memory,
            generation,
            logger,
            router,
            tools,
            graph_config,
            stream_config,
            default_system_prompt,
        }
    }

    /// Registers this node's heartbeat for the process lifetime. The
    /// caller typically does `tokio::spawn(engine.heartbeat_loop("node-1"))`
    /// once at startup.
    pub async fn heartbeat_loop(&self, node_id: impl Into<String>) {
        run_heartbeat(self.bus.clone(), node_id.into()).await;
    }

    pub async fn active_nodes(&self) -> ra_domain::error::Result<Vec<String>> {
        get_active_nodes(self.bus.as_ref()).await
    }

    /// Accepts a user turn: derives identifiers, enforces the
    /// single-in-flight-generation-per-conversation guard, stores the
    /// user message, and spawns the graph run in the background. The
    /// returned handle's `message_id` is immediately subscribable via
    /// [`ra_stream::subscribe_to_message`] regardless of whether the
    /// caller wants a streaming or a collected response — both read the
    /// same channel, they just differ in whether frames are relayed or
    /// drained to a final string.
    pub async fn respond(&self, query: &str, options: RespondOptions) -> Result<TurnHandle, EngineError> {
        let conversation_id = options
            .conversation_id
            .unwrap_or_else(|| self.memory.generate_conversation_id(Some(query)));

        let generation_id = self
            .generation
            .start_generation(&conversation_id, None)
            .await?
            .ok_or(EngineError::GenerationInProgress)?;

        let message_id = uuid::Uuid::new_v4().to_string();

        self.memory
            .add_message(Message::new(&conversation_id, Role::User, query))
            .await?;

        let system_message = options.system_prompt.or_else(|| self.default_system_prompt.clone());
        let previous_summary = self.memory.get_executive_summary(&conversation_id).await?
            .or(self.memory.get_trailing_summary(&conversation_id).await?);
        let recent_messages = self
            .memory
            .get_context_for_conversation(&conversation_id)
            .await?
            .into_iter()
            .map(to_llm_message)
            .collect();

        let mut state = GraphState::new(&conversation_id, &generation_id, &message_id, query);
        state.system_message = system_message;
        state.previous_summary = previous_summary;
        state.recent_messages = recent_messages;

        let runtime = GraphRuntime {
            router: self.router.clone(),
            tools: self.tools.clone(),
            replan_cap: self.graph_config.replan_cap as u32,
        };
        let max_tool_loop = self.graph_config.max_tool_loop;
        let ready_timeout = std::time::Duration::from_secs(self.stream_config.ready_handshake_timeout_secs);

        let bus = self.bus.clone();
        let store = self.store.clone();
        let memory = self.memory.clone();
        let generation = self.generation.clone();
        let router = self.router.clone();
        let logger = self.logger.clone();
        let conversation_id_task = conversation_id.clone();
        let message_id_task = message_id.clone();
        let generation_id_task = generation_id.clone();

        tokio::spawn(async move {
            run_turn_to_completion(
                bus,
                store,
                memory,
                generation,
                router,
                logger,
                runtime,
                state,
                conversation_id_task,
                message_id_task,
                generation_id_task,
                max_tool_loop,
                ready_timeout,
            )
            .await;
        });

        Ok(TurnHandle { conversation_id, message_id, generation_id })
    }
}

fn to_llm_message(message: Message) -> ra_domain::tool::Message {
    match message.role {
        Role::System => ra_domain::tool::Message::system(message.content),
        Role::User => ra_domain::tool::Message::user(message.content),
        Role::Assistant => ra_domain::tool::Message::assistant(message.content),
        Role::Tool => ra_domain::tool::Message::tool_result(String::new(), message.content),
    }
}

/// Drives one turn's graph execution to completion and fans the result
/// out to the generation record, the durable/hot message stores, the
/// Stream Pipeline's terminal frame, and the C10 background tasks —
/// all off the request path.
#[allow(clippy::too_many_arguments)]
async fn run_turn_to_completion(
    bus: Arc<dyn Bus>,
    store: Arc<dyn DurableStore>,
    memory: Arc<MemoryManager>,
    generation: Arc<GenerationRegistry>,
    router: Arc<LlmRouter>,
    logger: Arc<dyn Logger>,
    runtime: GraphRuntime,
    state: GraphState,
    conversation_id: String,
    message_id: String,
    generation_id: String,
    max_tool_loop: usize,
    ready_timeout: std::time::Duration,
) {
    let mut publisher = StreamPublisher::start(bus.clone(), &conversation_id, &message_id).await;
    publisher.await_ready_handshake(ready_timeout).await;

    match ra_graph::run_turn(&runtime, state, &mut publisher, max_tool_loop).await {
        Ok(final_state) => {
            match memory
                .add_message(Message::new(&conversation_id, Role::Assistant, &final_state.response))
                .await
            {
                Ok(Some(staged)) => {
                    let memory = memory.clone();
                    let router = router.clone();
                    tokio::spawn(async move { trailing_summary_task(&memory, &router, staged).await });
                }
                Ok(None) => {}
                Err(error) => tracing::warn!(%conversation_id, %error, "failed to store assistant reply"),
            }

            if let Err(error) = generation
                .complete_generation(
                    &generation_id,
                    CompleteGenerationParams {
                        response: final_state.response.clone(),
                        route: final_state.finish_reason.clone(),
                        ..Default::default()
                    },
                )
                .await
            {
                tracing::warn!(%generation_id, %error, "failed to complete generation record");
            }

            publisher
                .complete(serde_json::json!({ "finishReason": final_state.finish_reason }))
                .await;

            for thought in final_state.thoughts {
                if let Err(error) = store.store_thought(thought).await {
                    tracing::warn!(%conversation_id, %error, "failed to persist planner thought");
                }
            }

            let entry = ra_domain::model::LogEntry::new(
                ra_domain::model::LogLevel::Success,
                ra_domain::model::LogCategory::Generation,
                "turn completed",
            )
            .with_generation(generation_id.clone())
            .with_conversation(conversation_id.clone());
            if let Err(error) = logger.log(entry).await {
                tracing::warn!(%generation_id, %error, "failed to publish turn-completed log entry");
            }

            schedule_post_turn_tasks(bus, store, memory, router, conversation_id).await;
        }
        Err(error) => {
            let message = error.to_string();
            if let Err(log_error) = generation.fail_generation(&generation_id, &message).await {
                tracing::warn!(%generation_id, %log_error, "failed to record generation failure");
            }

            let entry = ra_domain::model::LogEntry::new(
                ra_domain::model::LogLevel::Error,
                ra_domain::model::LogCategory::Generation,
                format!("turn failed: {message}"),
            )
            .with_generation(generation_id.clone())
            .with_conversation(conversation_id.clone());
            if let Err(log_error) = logger.log(entry).await {
                tracing::warn!(%generation_id, %log_error, "failed to publish turn-failed log entry");
            }

            publisher.fail(message).await;
        }
    }
}

/// After a turn lands successfully: bump the conversation's message
/// count, and fire the title/executive-summary background tasks whose
/// triggers depend on it.
async fn schedule_post_turn_tasks(
    bus: Arc<dyn Bus>,
    store: Arc<dyn DurableStore>,
    memory: Arc<MemoryManager>,
    router: Arc<LlmRouter>,
    conversation_id: String,
) {
    let mut metadata = match get_conversation_metadata(bus.as_ref(), &conversation_id).await {
        Ok(metadata) => metadata,
        Err(error) => {
            tracing::warn!(%conversation_id, %error, "failed to load conversation metadata for post-turn tasks");
            return;
        }
    };
    metadata.message_count += 2;
    metadata.last_updated_at = Utc::now();
    if let Err(error) = put_conversation_metadata(bus.as_ref(), &metadata).await {
        tracing::warn!(%conversation_id, %error, "failed to persist bumped message count");
    }
    if let Err(error) = store.upsert_conversation(metadata.clone()).await {
        tracing::warn!(%conversation_id, %error, "failed to persist conversation record");
    }

    let assistant_reply_count = metadata.message_count / 2;

    if should_generate_title(metadata.message_count) {
        title_generation_task(bus.as_ref(), &memory, store.as_ref(), &router, &conversation_id).await;
    }
    executive_summary_task(&memory, &router, &conversation_id, assistant_reply_count).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ra_bus::InMemoryBus;
    use ra_domain::config::{
        AuthConfig, AuthMode, GenerationConfig, LlmConfig, MemoryConfig, ProviderConfig,
        ProviderKind, RoleConfig,
    };
    use ra_logger::BusLogger;
    use ra_store::JsonlStore;
    use std::collections::HashMap;

    fn engine_with(bus: Arc<dyn Bus>) -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DurableStore> = Arc::new(JsonlStore::new(dir.path()).unwrap());
        let memory = Arc::new(MemoryManager::new(
            bus.clone(),
            store.clone(),
            MemoryConfig { max_context_tokens: 30_000, summary_cushion_tokens: 2_000, hot_cache_cap: 100 },
        ));
        let generation = Arc::new(GenerationRegistry::new(bus.clone(), store.clone(), GenerationConfig::default()));
        let logger: Arc<dyn Logger> = Arc::new(BusLogger::new(bus.clone(), 3600));
        let tools = Arc::new(ToolRegistry::empty(bus.clone()));

        let mut roles = HashMap::new();
        roles.insert("planner".to_string(), RoleConfig { model: "unreachable/model".into(), require_json: true, require_streaming: false, fallbacks: vec![] });
        roles.insert("responder".to_string(), RoleConfig { model: "unreachable/model".into(), require_json: false, require_streaming: true, fallbacks: vec![] });
        let llm_config = LlmConfig {
            providers: vec![ProviderConfig {
                id: "unreachable".into(),
                kind: ProviderKind::OpenaiCompat,
                base_url: "https://api.example.com/v1".into(),
                auth: AuthConfig { mode: AuthMode::None, ..AuthConfig::default() },
                default_model: None,
            }],
            roles,
            ..LlmConfig::default()
        };
        let router = Arc::new(LlmRouter::from_config(&llm_config).unwrap());

        let engine = Engine::new(
            bus,
            store,
            memory,
            generation,
            logger,
            router,
            tools,
            ra_domain::config::GraphConfig::default(),
            ra_domain::config::StreamConfig::default(),
            None,
        );
        (engine, dir)
    }

    #[tokio::test]
    async fn respond_assigns_a_handle_and_stores_the_user_message() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let (engine, _dir) = engine_with(bus.clone());

        let handle = engine
            .respond("hello there", RespondOptions::default())
            .await
            .unwrap();

        assert!(!handle.message_id.is_empty());
        assert!(!handle.generation_id.is_empty());

        // Give the spawned turn a moment to store the user message
        // before the assistant turn (which will fail fast: no reachable
        // provider) marks the stream terminal.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let messages = engine.memory.get_messages(&handle.conversation_id).await.unwrap();
        assert!(messages.iter().any(|m| m.content == "hello there"));
    }

    #[tokio::test]
    async fn respond_rejects_a_second_concurrent_turn_for_the_same_conversation() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let (engine, _dir) = engine_with(bus.clone());

        let first = engine
            .respond("first", RespondOptions { conversation_id: Some("conv-fixed".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(first.conversation_id, "conv-fixed");

        let second = engine
            .respond("second", RespondOptions { conversation_id: Some("conv-fixed".into()), ..Default::default() })
            .await;
        assert!(matches!(second, Err(EngineError::GenerationInProgress)));
    }

    #[tokio::test]
    async fn failed_turn_surfaces_an_error_frame_on_the_stream() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let (engine, _dir) = engine_with(bus.clone());

        let handle = engine
            .respond("hello", RespondOptions::default())
            .await
            .unwrap();

        let mut stream = ra_stream::subscribe_to_message(bus, handle.message_id);
        use futures_util::StreamExt;
        let mut saw_error = false;
        while let Some(frame) = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .expect("stream should terminate before the test timeout")
        {
            if matches!(frame, Ok(ra_stream::StreamFrame::Error { .. })) {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error, "expected the unreachable provider to surface an error frame");
    }

    #[tokio::test]
    async fn heartbeat_and_active_nodes_roundtrip() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let (engine, _dir) = engine_with(bus.clone());
        bus.sadd("heartbeat:nodes", "node-x").await.unwrap();
        bus.set("heartbeat:node:node-x", "now", Some(std::time::Duration::from_secs(30))).await.unwrap();
        let active = engine.active_nodes().await.unwrap();
        assert_eq!(active, vec!["node-x".to_string()]);
    }
}
