//! `ra-background` — fire-and-forget work scheduled off the back of a
//! user turn: trailing/executive summarization, title generation, and
//! node heartbeats. Every task here follows the same swallow-and-log
//! discipline as the rest of the runtime — a failure here must never
//! surface to the user, it just means the next turn still has stale
//! metadata.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ra_bus::Bus;
use ra_domain::config::MemoryConfig;
use ra_domain::model::Conversation;
use ra_domain::tool::Message as LlmMessage;
use ra_memory::{MemoryManager, TrimStaged};
use ra_providers::{ChatRequest, LlmRouter};
use ra_store::DurableStore;

const SUMMARIZER_ROLE: &str = "summarizer";
const TITLE_ROLE: &str = "title";
const EXECUTIVE_SUMMARY_WORD_CAP: usize = 400;
const TITLE_WORD_CAP: usize = 5;
const HEARTBEAT_TTL: Duration = Duration::from_secs(30);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

fn conversation_metadata_key(conversation_id: &str) -> String {
    format!("conversations:{conversation_id}:metadata")
}

/// Read the conversation metadata record (the `Conversation` shape the
/// spec describes as a Bus hash — here a single JSON-encoded value
/// under the same key, matching how `ra-memory` already represents the
/// trailing/executive summary fields as plain values rather than
/// per-field hash entries).
pub async fn get_conversation_metadata(
    bus: &dyn Bus,
    conversation_id: &str,
) -> ra_domain::error::Result<Conversation> {
    match bus.get(&conversation_metadata_key(conversation_id)).await? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(Conversation::new(conversation_id)),
    }
}

pub async fn put_conversation_metadata(
    bus: &dyn Bus,
    conversation: &Conversation,
) -> ra_domain::error::Result<()> {
    let payload = serde_json::to_string(conversation)?;
    bus.set(&conversation_metadata_key(&conversation.conversation_id), &payload, None)
        .await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trailing summarization — runs after every assistant reply that
// staged a trim.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn trailing_summary_task(memory: &MemoryManager, router: &LlmRouter, staged: TrimStaged) {
    let prompt = format!(
        "Summarize the following conversation excerpt in a few sentences, \
         preserving names, decisions, and open questions:\n\n{}",
        staged.content_to_summarize
    );
    let req = ChatRequest {
        messages: vec![LlmMessage::user(prompt)],
        ..Default::default()
    };

    match router.chat_for_role(SUMMARIZER_ROLE, req).await {
        Ok(response) => {
            if let Err(error) = memory
                .set_trailing_summary(&staged.conversation_id, response.content.trim())
                .await
            {
                tracing::warn!(conversation_id = %staged.conversation_id, %error, "failed to persist trailing summary");
            }
        }
        Err(error) => {
            tracing::warn!(conversation_id = %staged.conversation_id, %error, "trailing summarization LLM call failed");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executive summary — after the 3rd and every subsequent assistant
// reply.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn executive_summary_task(
    memory: &MemoryManager,
    router: &LlmRouter,
    conversation_id: &str,
    assistant_reply_count: u64,
) {
    if assistant_reply_count < 3 {
        return;
    }

    let messages = match memory.get_all_messages_from_db(conversation_id).await {
        Ok(messages) => messages,
        Err(error) => {
            tracing::warn!(%conversation_id, %error, "failed to load messages for executive summary");
            return;
        }
    };
    let transcript = messages
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Summarize this entire conversation in at most {EXECUTIVE_SUMMARY_WORD_CAP} words:\n\n{transcript}"
    );
    let req = ChatRequest {
        messages: vec![LlmMessage::user(prompt)],
        ..Default::default()
    };

    match router.chat_for_role(SUMMARIZER_ROLE, req).await {
        Ok(response) => {
            let capped = cap_words(response.content.trim(), EXECUTIVE_SUMMARY_WORD_CAP);
            if let Err(error) = memory.set_executive_summary(conversation_id, &capped).await {
                tracing::warn!(%conversation_id, %error, "failed to persist executive summary");
            }
        }
        Err(error) => {
            tracing::warn!(%conversation_id, %error, "executive summary LLM call failed");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Title generation — once after the 2nd message, once after the 6th.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn should_generate_title(message_count: u64) -> bool {
    message_count == 2 || message_count == 6
}

pub async fn title_generation_task(
    bus: &dyn Bus,
    memory: &MemoryManager,
    store: &dyn DurableStore,
    router: &LlmRouter,
    conversation_id: &str,
) {
    let mut metadata = match get_conversation_metadata(bus, conversation_id).await {
        Ok(metadata) => metadata,
        Err(error) => {
            tracing::warn!(%conversation_id, %error, "failed to load conversation metadata for title generation");
            return;
        }
    };
    if metadata.title_set_by_user {
        return;
    }

    let messages = match memory.get_messages(conversation_id).await {
        Ok(messages) => messages,
        Err(error) => {
            tracing::warn!(%conversation_id, %error, "failed to load messages for title generation");
            return;
        }
    };
    let excerpt: String = messages
        .iter()
        .take(6)
        .map(|m| format!("{:?}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let prompt = format!(
        "Give this conversation a short title of at most {TITLE_WORD_CAP} words. \
         Respond with only the title, no quotes or punctuation.\n\n{excerpt}"
    );
    let req = ChatRequest {
        messages: vec![LlmMessage::user(prompt)],
        ..Default::default()
    };

    let title = match router.chat_for_role(TITLE_ROLE, req).await {
        Ok(response) => cap_words(response.content.trim(), TITLE_WORD_CAP),
        Err(error) => {
            tracing::warn!(%conversation_id, %error, "title generation LLM call failed");
            return;
        }
    };
    if title.is_empty() {
        return;
    }

    metadata.title = Some(title.clone());
    metadata.last_updated_at = Utc::now();
    if let Err(error) = put_conversation_metadata(bus, &metadata).await {
        tracing::warn!(%conversation_id, %error, "failed to persist title to bus metadata");
    }
    if let Err(error) = store.update_conversation_title(conversation_id, &title).await {
        tracing::warn!(%conversation_id, %error, "failed to persist title to durable store");
    }
}

fn cap_words(text: &str, max_words: usize) -> String {
    text.split_whitespace().take(max_words).collect::<Vec<_>>().join(" ")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heartbeat — nodes register themselves so an admin surface can expose
// the active fleet.
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const HEARTBEAT_SET_KEY: &str = "heartbeat:nodes";

fn heartbeat_key(node_id: &str) -> String {
    format!("heartbeat:node:{node_id}")
}

/// Registers `node_id` and refreshes its TTL key every
/// [`HEARTBEAT_INTERVAL`] until the returned future is dropped/aborted
/// (the caller typically `tokio::spawn`s this for the process lifetime).
pub async fn run_heartbeat(bus: Arc<dyn Bus>, node_id: String) {
    if let Err(error) = bus.sadd(HEARTBEAT_SET_KEY, &node_id).await {
        tracing::warn!(%node_id, %error, "failed to register node in heartbeat set");
    }
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        interval.tick().await;
        let now = Utc::now().to_rfc3339();
        if let Err(error) = bus.set(&heartbeat_key(&node_id), &now, Some(HEARTBEAT_TTL)).await {
            tracing::warn!(%node_id, %error, "failed to refresh heartbeat TTL");
        }
    }
}

/// Active nodes: members of the heartbeat set whose TTL key hasn't
/// expired. Stale members (crashed without deregistering) are pruned
/// from the set as a side effect.
pub async fn get_active_nodes(bus: &dyn Bus) -> ra_domain::error::Result<Vec<String>> {
    let members = bus.smembers(HEARTBEAT_SET_KEY).await?;
    let mut active = Vec::new();
    for node_id in members {
        match bus.get(&heartbeat_key(&node_id)).await? {
            Some(_) => active.push(node_id),
            None => {
                let _ = bus.srem(HEARTBEAT_SET_KEY, &node_id).await;
            }
        }
    }
    Ok(active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ra_bus::InMemoryBus;
    use ra_domain::config::{AuthConfig, AuthMode, LlmConfig, ProviderConfig, ProviderKind, RoleConfig};
    use ra_domain::tool::Role;
    use ra_store::JsonlStore;
    use std::collections::HashMap;

    fn memory_with(bus: Arc<dyn Bus>) -> (MemoryManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn DurableStore> = Arc::new(JsonlStore::new(dir.path()).unwrap());
        let manager = MemoryManager::new(
            bus,
            store,
            MemoryConfig { max_context_tokens: 30_000, summary_cushion_tokens: 2_000, hot_cache_cap: 100 },
        );
        (manager, dir)
    }

    fn router_with_no_providers() -> LlmRouter {
        let mut roles = HashMap::new();
        roles.insert(SUMMARIZER_ROLE.to_string(), RoleConfig { model: "missing/model".into(), require_json: false, require_streaming: false, fallbacks: vec![] });
        roles.insert(TITLE_ROLE.to_string(), RoleConfig { model: "missing/model".into(), require_json: false, require_streaming: false, fallbacks: vec![] });
        let config = LlmConfig {
            providers: vec![ProviderConfig {
                id: "missing".into(),
                kind: ProviderKind::OpenaiCompat,
                base_url: "https://api.example.com/v1".into(),
                auth: AuthConfig { mode: AuthMode::ApiKey, env: Some("RA_BG_TEST_MISSING_KEY".into()), ..AuthConfig::default() },
                default_model: None,
            }],
            roles,
            ..LlmConfig::default()
        };
        LlmRouter::from_config(&config).unwrap()
    }

    #[test]
    fn should_generate_title_only_on_second_and_sixth_message() {
        assert!(should_generate_title(2));
        assert!(should_generate_title(6));
        assert!(!should_generate_title(1));
        assert!(!should_generate_title(3));
        assert!(!should_generate_title(7));
    }

    #[test]
    fn cap_words_truncates_to_limit() {
        assert_eq!(cap_words("one two three four five six", 5), "one two three four five");
        assert_eq!(cap_words("short", 5), "short");
        assert_eq!(cap_words("", 5), "");
    }

    #[tokio::test]
    async fn conversation_metadata_roundtrips_through_bus() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let mut conv = Conversation::new("conv-1");
        conv.title = Some("hello".into());
        put_conversation_metadata(bus.as_ref(), &conv).await.unwrap();
        let loaded = get_conversation_metadata(bus.as_ref(), "conv-1").await.unwrap();
        assert_eq!(loaded.title, Some("hello".into()));
    }

    #[tokio::test]
    async fn missing_metadata_returns_fresh_conversation() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let loaded = get_conversation_metadata(bus.as_ref(), "never-seen").await.unwrap();
        assert_eq!(loaded.conversation_id, "never-seen");
        assert!(loaded.title.is_none());
    }

    #[tokio::test]
    async fn title_generation_skips_when_title_set_by_user() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let (memory, _dir) = memory_with(bus.clone());
        let dir2 = tempfile::tempdir().unwrap();
        let store = JsonlStore::new(dir2.path()).unwrap();
        let router = router_with_no_providers();

        let mut conv = Conversation::new("conv-1");
        conv.title_set_by_user = true;
        conv.title = Some("user chosen".into());
        put_conversation_metadata(bus.as_ref(), &conv).await.unwrap();

        title_generation_task(bus.as_ref(), &memory, &store, &router, "conv-1").await;

        let loaded = get_conversation_metadata(bus.as_ref(), "conv-1").await.unwrap();
        assert_eq!(loaded.title, Some("user chosen".into()));
    }

    #[tokio::test]
    async fn executive_summary_skips_before_third_reply() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let (memory, _dir) = memory_with(bus.clone());
        let router = router_with_no_providers();
        executive_summary_task(&memory, &router, "conv-1", 2).await;
        assert_eq!(memory.get_executive_summary("conv-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn heartbeat_registration_then_active_nodes_contains_it() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        bus.sadd(HEARTBEAT_SET_KEY, "node-1").await.unwrap();
        bus.set(&heartbeat_key("node-1"), "now", Some(Duration::from_secs(30))).await.unwrap();
        let active = get_active_nodes(bus.as_ref()).await.unwrap();
        assert_eq!(active, vec!["node-1".to_string()]);
    }

    #[tokio::test]
    async fn stale_heartbeat_member_is_pruned() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        bus.sadd(HEARTBEAT_SET_KEY, "gone").await.unwrap();
        // No TTL key written for "gone" -- simulates an expired/crashed node.
        let active = get_active_nodes(bus.as_ref()).await.unwrap();
        assert!(active.is_empty());
        assert!(bus.smembers(HEARTBEAT_SET_KEY).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trailing_summary_task_logs_and_continues_on_llm_failure() {
        let bus: Arc<dyn Bus> = Arc::new(InMemoryBus::new());
        let (memory, _dir) = memory_with(bus.clone());
        let router = router_with_no_providers();
        let staged = TrimStaged { conversation_id: "conv-1".into(), content_to_summarize: "User: hi\n".into() };
        trailing_summary_task(&memory, &router, staged).await;
        assert_eq!(memory.get_trailing_summary("conv-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn message_new_uses_role_variant() {
        let message = ra_domain::model::Message::new("conv-1", Role::User, "hi");
        assert_eq!(message.content, "hi");
    }
}
