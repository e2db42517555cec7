//! The conversation-turn data model: `Conversation`, `Message`,
//! `ToolExecution`, `Generation`, `LogEntry`, `Thought`, `ExecutionPlan`,
//! and `MessageGenerationState`.
//!
//! These are the *persisted/streamed* record shapes, distinct from
//! [`crate::tool::Message`] which is the provider-facing message the
//! responder node builds a prompt out of.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::tool::Role;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub message_count: u64,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub title_set_by_user: bool,
    #[serde(default)]
    pub trailing_summary_present: bool,
    /// Staged by the trim-and-summarize protocol; cleared once
    /// the background trailing-summary task has run.
    #[serde(default)]
    pub needs_trailing_summary_generation: bool,
    #[serde(default)]
    pub content_to_summarize: Option<String>,
}

impl Conversation {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            title: None,
            message_count: 0,
            last_updated_at: Utc::now(),
            total_tokens: 0,
            title_set_by_user: false,
            trailing_summary_present: false,
            needs_trailing_summary_generation: false,
            content_to_summarize: None,
        }
    }

    /// Deterministic conversation id: stable 16-hex prefix of
    /// `SHA-256(seed)`. Used when a seed message is available so retries
    /// of the same first turn land on the same conversation.
    pub fn id_from_seed(seed: &str) -> String {
        let digest = Sha256::digest(seed.as_bytes());
        hex::encode(&digest[..8])
    }

    /// Fresh random conversation id (16 hex chars) for when no seed is
    /// available.
    pub fn random_id() -> String {
        let bytes: [u8; 8] = uuid::Uuid::new_v4().as_bytes()[..8].try_into().unwrap();
        hex::encode(bytes)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message (persisted record)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tool_executions: Vec<ToolExecution>,
}

impl Message {
    pub fn new(
        conversation_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_executions: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolExecution / ToolEvent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolExecutionStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub tool_id: String,
    pub tool_type: String,
    pub tool_name: String,
    pub status: ToolExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// One event in a `tool:event:<message_id>` stream. Folding an ordered
/// sequence of these for a given `tool_id` reconstructs a [`ToolExecution`]
///.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolEvent {
    #[serde(rename = "tool_start")]
    ToolStart {
        tool_id: String,
        tool_type: String,
        tool_name: String,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    #[serde(rename = "tool_progress")]
    ToolProgress {
        tool_id: String,
        step: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<f32>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "tool_complete")]
    ToolComplete {
        tool_id: String,
        result: serde_json::Value,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    #[serde(rename = "tool_error")]
    ToolError {
        tool_id: String,
        error: String,
        timestamp: DateTime<Utc>,
        #[serde(default)]
        metadata: serde_json::Value,
    },
}

impl ToolEvent {
    pub fn tool_id(&self) -> &str {
        match self {
            ToolEvent::ToolStart { tool_id, .. }
            | ToolEvent::ToolProgress { tool_id, .. }
            | ToolEvent::ToolComplete { tool_id, .. }
            | ToolEvent::ToolError { tool_id, .. } => tool_id,
        }
    }
}

/// Fold an ordered sequence of [`ToolEvent`]s into [`ToolExecution`]
/// records, one per distinct `tool_id`, preserving first-seen order.
pub fn fold_tool_executions(events: &[ToolEvent]) -> Vec<ToolExecution> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, ToolExecution> = HashMap::new();

    for event in events {
        match event {
            ToolEvent::ToolStart {
                tool_id,
                tool_type,
                tool_name,
                timestamp,
                metadata,
            } => {
                order.push(tool_id.clone());
                by_id.insert(
                    tool_id.clone(),
                    ToolExecution {
                        tool_id: tool_id.clone(),
                        tool_type: tool_type.clone(),
                        tool_name: tool_name.clone(),
                        status: ToolExecutionStatus::Running,
                        start_time: *timestamp,
                        end_time: None,
                        duration_ms: None,
                        steps: Vec::new(),
                        current_step: None,
                        progress: None,
                        result: None,
                        error: None,
                        metadata: metadata.clone(),
                    },
                );
            }
            ToolEvent::ToolProgress {
                tool_id,
                step,
                progress,
                ..
            } => {
                if let Some(exec) = by_id.get_mut(tool_id) {
                    exec.steps.push(step.clone());
                    exec.current_step = Some(step.clone());
                    if progress.is_some() {
                        exec.progress = *progress;
                    }
                }
            }
            ToolEvent::ToolComplete {
                tool_id,
                result,
                timestamp,
                ..
            } => {
                if let Some(exec) = by_id.get_mut(tool_id) {
                    exec.status = ToolExecutionStatus::Completed;
                    exec.end_time = Some(*timestamp);
                    exec.duration_ms = Some((*timestamp - exec.start_time).num_milliseconds());
                    exec.result = Some(result.clone());
                }
            }
            ToolEvent::ToolError {
                tool_id,
                error,
                timestamp,
                ..
            } => {
                if let Some(exec) = by_id.get_mut(tool_id) {
                    exec.status = ToolExecutionStatus::Error;
                    exec.end_time = Some(*timestamp);
                    exec.duration_ms = Some((*timestamp - exec.start_time).num_milliseconds());
                    exec.error = Some(error.clone());
                }
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Generation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Generating,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub generation_id: String,
    pub conversation_id: String,
    pub status: GenerationStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<crate::stream::Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
}

impl Generation {
    pub fn new(generation_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            generation_id: generation_id.into(),
            conversation_id: conversation_id.into(),
            status: GenerationStatus::Generating,
            started_at: Utc::now(),
            completed_at: None,
            route: None,
            tools_used: Vec::new(),
            model: None,
            tokens: None,
            error: None,
            response: None,
            thinking: None,
        }
    }

    /// Age since `started_at`, used by the stale-reclaim check.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }

    pub fn is_generating(&self) -> bool {
        self.status == GenerationStatus::Generating
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LogEntry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Router,
    Tool,
    Chat,
    Thought,
    Memory,
    System,
    Generation,
    Mcp,
    Context,
    Executor,
    Planner,
    Responder,
    Search,
    Scrape,
    Command,
    Fastpath,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub category: LogCategory,
    /// May embed inline colour tags (`<red>…</red>`) — opaque data to the
    /// core; readers decide whether to render or strip them.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl LogEntry {
    pub fn new(
        level: LogLevel,
        category: LogCategory,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            level,
            category,
            message: message.into(),
            generation_id: None,
            conversation_id: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_generation(mut self, generation_id: impl Into<String>) -> Self {
        self.generation_id = Some(generation_id.into());
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thought
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThoughtSource {
    Chat,
    Router,
    ToolPicker,
    SearchQueryOptimization,
    SearchResultExtraction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thought {
    pub thought_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub conversation_id: String,
    pub generation_id: String,
    pub source: ThoughtSource,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ExecutionPlan
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandDomain {
    System,
    Api,
    Home,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlanStep {
    #[serde(rename = "search")]
    Search { purpose: String, search_query: String },
    #[serde(rename = "command")]
    Command {
        purpose: String,
        domain: CommandDomain,
        command_details: String,
    },
    #[serde(rename = "respond")]
    Respond { purpose: String },
}

impl PlanStep {
    pub fn is_respond(&self) -> bool {
        matches!(self, PlanStep::Respond { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// A plan must end with a `respond` step.
    pub fn ends_with_respond(&self) -> bool {
        matches!(self.steps.last(), Some(step) if step.is_respond())
    }

    /// Fallback plan used when the planner LLM call fails.
    pub fn direct_fallback() -> Self {
        Self {
            steps: vec![PlanStep::Respond {
                purpose: "direct".into(),
            }],
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MessageGenerationState (streaming state)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Generating,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageGenerationState {
    pub conversation_id: String,
    pub message_id: String,
    pub status: StreamStatus,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub thinking: String,
    #[serde(default)]
    pub tool_events: Vec<ToolEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl MessageGenerationState {
    pub fn new(conversation_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            status: StreamStatus::Generating,
            content: String::new(),
            thinking: String::new(),
            tool_events: Vec::new(),
            current_status: None,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            metadata: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, StreamStatus::Completed | StreamStatus::Error)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
