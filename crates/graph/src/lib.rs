//! `ra-graph` — the planner/executor/specialist state machine.
//!
//! A shared [`GraphState`] flows through a small set of node functions
//! (`planner_node`, `executor_node`, `search_node`, `command_node`,
//! `responder_node`), each a pure async transform of state into a state
//! patch. [`run_turn`] owns the edges between them — mirroring the way
//! [`ra_providers::LlmRouter`] owns fallback edges between providers
//! rather than leaving that decision to the provider adapters
//! themselves.

use std::sync::Arc;

use chrono::Utc;
use ra_domain::error::{Error, Result};
use ra_domain::model::{CommandDomain, ExecutionPlan, PlanStep, Thought, ThoughtSource, ToolEvent};
use ra_domain::tool::Message as LlmMessage;
use ra_providers::{ChatRequest, LlmRouter};
use ra_stream::StreamPublisher;
use ra_tools::{ToolCallContext, ToolRegistry};

/// Which specialist the executor routed to, mirroring the step tag the
/// plan used to select it — kept distinct from `PlanStep` so internal
/// routing (`responder` as a terminal target) doesn't need a matching
/// plan-step variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextNode {
    Executor,
    Search,
    Command,
    Responder,
    Planner,
    Done,
}

/// The step "kind" used for the second-consecutive-failure degraded-prompt
/// rule — deliberately coarser than `PlanStep` (a `search` step failing
/// twice in a row degrades regardless of the exact query).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    Search,
    Command,
}

/// Shared state threaded through every node.
#[derive(Debug, Clone)]
pub struct GraphState {
    pub conversation_id: String,
    pub generation_id: String,
    pub message_id: String,
    pub query: String,
    pub system_message: Option<String>,
    pub previous_summary: Option<String>,
    pub recent_messages: Vec<LlmMessage>,

    pub plan: ExecutionPlan,
    pub current_step_index: usize,
    pub replanned_count: u32,
    pub request_replan: bool,

    pub tool_events: Vec<ToolEvent>,
    pub thoughts: Vec<Thought>,
    pub step_results: Vec<String>,

    pub response: String,
    pub finish_reason: Option<String>,

    last_failure: Option<StepKind>,
}

impl GraphState {
    pub fn new(
        conversation_id: impl Into<String>,
        generation_id: impl Into<String>,
        message_id: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            generation_id: generation_id.into(),
            message_id: message_id.into(),
            query: query.into(),
            system_message: None,
            previous_summary: None,
            recent_messages: Vec::new(),
            plan: ExecutionPlan::default(),
            current_step_index: 0,
            replanned_count: 0,
            request_replan: false,
            tool_events: Vec::new(),
            thoughts: Vec::new(),
            step_results: Vec::new(),
            response: String::new(),
            finish_reason: None,
            last_failure: None,
        }
    }
}

/// Runtime dependencies every node may need. Nodes take `&GraphRuntime`
/// rather than owning these directly, matching the Stream Pipeline's
/// "the caller owns the publisher, nodes just write through it" shape.
pub struct GraphRuntime {
    pub router: Arc<LlmRouter>,
    pub tools: Arc<ToolRegistry>,
    pub replan_cap: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error(transparent)]
    Llm(#[from] Error),
}

const PLANNER_ROLE: &str = "planner";
const RESPONDER_ROLE: &str = "responder";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Planner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Given the query and assembled context, produce an `ExecutionPlan`.
/// On LLM failure, falls back to a direct-respond plan rather than
/// aborting the turn.
pub async fn planner_node(runtime: &GraphRuntime, mut state: GraphState, is_replan: bool) -> GraphState {
    if is_replan {
        state.replanned_count += 1;
        state.request_replan = false;
    }

    let prompt = format!(
        "You are a planning module. Given the user's request, produce a JSON execution plan \
         with a `steps` array. Each step is one of {{type:\"search\", purpose, search_query}}, \
         {{type:\"command\", purpose, domain, command_details}}, or {{type:\"respond\", purpose}}. \
         The final step must always be type=\"respond\".\n\nUser request: {}",
        state.query
    );
    let req = ChatRequest {
        messages: vec![LlmMessage::system(prompt), LlmMessage::user(&state.query)],
        tools: vec![],
        temperature: Some(0.0),
        max_tokens: None,
        json_mode: true,
        model: None,
    };

    let plan = match runtime.router.chat_for_role(PLANNER_ROLE, req).await {
        Ok(response) => match parse_plan(&response.content) {
            Ok(plan) if plan.ends_with_respond() => plan,
            _ => ExecutionPlan::direct_fallback(),
        },
        Err(error) => {
            tracing::warn!(%error, "planner LLM call failed, falling back to direct response");
            ExecutionPlan::direct_fallback()
        }
    };

    state.thoughts.push(Thought {
        thought_id: format!("thought_{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
        message_id: Some(state.message_id.clone()),
        conversation_id: state.conversation_id.clone(),
        generation_id: state.generation_id.clone(),
        source: ThoughtSource::Router,
        content: format!("planned {} step(s)", plan.steps.len()),
        timestamp: Utc::now(),
        metadata: serde_json::json!({}),
    });

    state.plan = plan;
    state.current_step_index = 0;
    state
}

fn parse_plan(raw: &str) -> Result<ExecutionPlan> {
    serde_json::from_str(raw).map_err(Error::Json)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reads `plan.steps[current_step_index]` and returns which specialist
/// to route to next. Does not itself advance `current_step_index` —
/// that happens on the return edge from each specialist, after the
/// step actually runs.
pub fn executor_node(state: &GraphState) -> NextNode {
    match state.plan.steps.get(state.current_step_index) {
        Some(PlanStep::Search { .. }) => NextNode::Search,
        Some(PlanStep::Command { .. }) => NextNode::Command,
        Some(PlanStep::Respond { .. }) | None => NextNode::Responder,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn search_node(runtime: &GraphRuntime, mut state: GraphState) -> GraphState {
    let (purpose, search_query) = match state.plan.steps.get(state.current_step_index) {
        Some(PlanStep::Search { purpose, search_query }) => (purpose.clone(), search_query.clone()),
        _ => {
            tracing::warn!("search_node reached with a non-search current step, skipping");
            state.current_step_index += 1;
            return state;
        }
    };

    let ctx = ToolCallContext {
        conversation_id: state.conversation_id.clone(),
        generation_id: state.generation_id.clone(),
        message_id: state.message_id.clone(),
    };

    let outcome = runtime
        .tools
        .call_tool("web_search", serde_json::json!({ "query": search_query }), &ctx)
        .await;

    match outcome {
        Ok(result) => {
            state.last_failure = None;
            let text = result
                .content
                .iter()
                .map(|c| c.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            state
                .step_results
                .push(format!("[search: {purpose}]\n{text}"));
        }
        Err(error) => {
            record_specialist_failure(&mut state, StepKind::Search, &purpose, &error.to_string());
        }
    }

    state.current_step_index += 1;
    state
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Command
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn command_node(runtime: &GraphRuntime, mut state: GraphState) -> GraphState {
    let (purpose, domain, command_details) = match state.plan.steps.get(state.current_step_index) {
        Some(PlanStep::Command { purpose, domain, command_details }) => {
            (purpose.clone(), *domain, command_details.clone())
        }
        _ => {
            tracing::warn!("command_node reached with a non-command current step, skipping");
            state.current_step_index += 1;
            return state;
        }
    };

    let ctx = ToolCallContext {
        conversation_id: state.conversation_id.clone(),
        generation_id: state.generation_id.clone(),
        message_id: state.message_id.clone(),
    };

    let outcome = runtime
        .tools
        .call_tool(
            "execute_command",
            serde_json::json!({ "domain": domain_str(domain), "details": command_details }),
            &ctx,
        )
        .await;

    match outcome {
        Ok(result) => {
            state.last_failure = None;
            let text = result
                .content
                .iter()
                .map(|c| c.text.as_str())
                .collect::<Vec<_>>()
                .join("\n");
            state.step_results.push(format!("[command: {purpose}]\n{text}"));
        }
        Err(error) => {
            record_specialist_failure(&mut state, StepKind::Command, &purpose, &error.to_string());
        }
    }

    state.current_step_index += 1;
    state
}

fn domain_str(domain: CommandDomain) -> &'static str {
    match domain {
        CommandDomain::System => "system",
        CommandDomain::Api => "api",
        CommandDomain::Home => "home",
    }
}

/// Tool-level errors never abort the graph: they're folded into the
/// next LLM prompt as a synthesised failure note so the model can
/// repair. A *second consecutive* failure on the same step kind sets
/// `request_replan` style degradation by jumping straight to
/// `responder` (handled by the caller via [`GraphState::degraded`]).
fn record_specialist_failure(state: &mut GraphState, kind: StepKind, purpose: &str, error: &str) {
    state
        .step_results
        .push(format!("[{purpose} failed: {error}]"));
    state.tool_events.push(ToolEvent::ToolError {
        tool_id: format!("step_{}", state.current_step_index),
        error: error.to_string(),
        timestamp: Utc::now(),
        metadata: serde_json::json!({}),
    });

    if state.last_failure == Some(kind) {
        // Two in a row: give up on the remaining plan and degrade
        // straight to a responder turn that's honest about the failure.
        state.plan = ExecutionPlan {
            steps: vec![PlanStep::Respond {
                purpose: "degraded after repeated tool failure".into(),
            }],
        };
        state.current_step_index = 0;
    }
    state.last_failure = Some(kind);
}

impl GraphState {
    /// Whether the last specialist step degraded the plan to an
    /// immediate responder turn.
    pub fn degraded(&self) -> bool {
        self.plan.steps.len() == 1 && matches!(self.plan.steps[0], PlanStep::Respond { .. }) && self.last_failure.is_some()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Responder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Assembles the final prompt and streams the LLM's reply through the
/// Stream Pipeline. Only `responder` stream-events are parsed for
/// user-visible `<think>` content — planner/executor/search events
/// never reach a [`StreamPublisher`].
pub async fn responder_node(
    runtime: &GraphRuntime,
    mut state: GraphState,
    publisher: &mut StreamPublisher,
) -> std::result::Result<GraphState, GraphError> {
    let mut messages = Vec::new();
    if let Some(system) = &state.system_message {
        messages.push(LlmMessage::system(system));
    }
    if let Some(summary) = &state.previous_summary {
        messages.push(LlmMessage::system(format!("Earlier in this conversation:\n{summary}")));
    }
    messages.extend(state.recent_messages.clone());
    if !state.step_results.is_empty() {
        messages.push(LlmMessage::system(format!(
            "Tool output gathered for this turn:\n{}",
            state.step_results.join("\n\n")
        )));
    }
    messages.push(LlmMessage::user(&state.query));

    let req = ChatRequest {
        messages,
        tools: vec![],
        temperature: None,
        max_tokens: None,
        json_mode: false,
        model: None,
    };

    let mut events = runtime.router.chat_stream_for_role(RESPONDER_ROLE, req).await?;
    use futures_util::StreamExt;
    let mut finish_reason = None;
    while let Some(event) = events.next().await {
        match event {
            Ok(ra_domain::stream::StreamEvent::Token { text }) => {
                publisher.push_token(&text).await;
            }
            Ok(ra_domain::stream::StreamEvent::Thinking { text }) => {
                publisher.push_token(&format!("<think>{text}</think>")).await;
            }
            Ok(ra_domain::stream::StreamEvent::Done { finish_reason: reason, .. }) => {
                finish_reason = reason;
            }
            Ok(ra_domain::stream::StreamEvent::Error { message }) => {
                return Err(GraphError::Llm(Error::Provider {
                    provider: "responder".into(),
                    message,
                }));
            }
            Ok(_) => {}
            Err(error) => return Err(GraphError::Llm(error)),
        }
    }
    publisher.finish_tokens().await;
    publisher.push_thinking_complete().await;

    state.finish_reason = finish_reason.or_else(|| Some("stop".to_string()));
    Ok(state)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drives `planner → executor → {search,command} → … → responder`
/// to completion for one turn, honoring the replan cap (`replannedCount
/// ≤ 3`) and the max-tool-loop guard.
pub async fn run_turn(
    runtime: &GraphRuntime,
    mut state: GraphState,
    publisher: &mut StreamPublisher,
    max_tool_loop: usize,
) -> std::result::Result<GraphState, GraphError> {
    state = planner_node(runtime, state, false).await;

    let mut loop_guard = 0usize;
    loop {
        match executor_node(&state) {
            NextNode::Search => {
                state = search_node(runtime, state).await;
            }
            NextNode::Command => {
                state = command_node(runtime, state).await;
            }
            NextNode::Responder => {
                state = responder_node(runtime, state, publisher).await?;
                if state.request_replan && state.replanned_count < runtime.replan_cap {
                    state = planner_node(runtime, state, true).await;
                    loop_guard += 1;
                    if loop_guard > max_tool_loop {
                        break;
                    }
                    continue;
                }
                break;
            }
            NextNode::Executor | NextNode::Planner | NextNode::Done => unreachable!("executor_node only returns Search/Command/Responder"),
        }

        loop_guard += 1;
        if loop_guard > max_tool_loop {
            tracing::warn!(max_tool_loop, "graph exceeded max tool loop, forcing responder");
            state.plan = ExecutionPlan {
                steps: vec![PlanStep::Respond { purpose: "loop guard triggered".into() }],
            };
            state.current_step_index = 0;
            state = responder_node(runtime, state, publisher).await?;
            break;
        }
    }

    Ok(state)
}
