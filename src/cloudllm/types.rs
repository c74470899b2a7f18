//! Shared vocabulary between the config resolver, prompt builder, LLM streaming client, tool
//! executor, and iteration controller.
//!
//! Nothing in this module talks to the network or the filesystem — it is pure data, passed by
//! reference into the controller and never mutated by it except through the service ports it is
//! paired with (see [`crate::cloudllm::controller`]).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cloudllm::config::ResolvedConfig;
use crate::cloudllm::event::EventPublisher;
use crate::cloudllm::tool_protocol::ToolExecutor;

/// The default per-call LLM chunk channel buffer (§6 Limits).
pub const LLM_CHUNK_CHANNEL_BUFFER: usize = 32;

/// Maximum consecutive per-iteration timeouts before a run aborts (§3 `IterationState`).
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 2;

/// Maximum alert payload size accepted by the core (§6 Limits). Enforcement happens at the
/// external API gate; this constant exists so tests and callers can assert against it.
pub const MAX_ALERT_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Default maximum iteration budget (§3 `ResolvedConfig`).
pub const DEFAULT_MAX_ITERATIONS: u32 = 20;

/// Default per-iteration timeout in seconds (§3 `ResolvedConfig`).
pub const DEFAULT_ITERATION_TIMEOUT_SECS: u64 = 120;

/// A role in a [`ConversationMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in the running transcript the controller builds and hands to the LLM client.
///
/// `tool_calls` is populated only on assistant messages that requested tool use; `tool_call_id`
/// and `tool_name` are populated only on tool-result messages, correlating back to the assistant
/// message that requested them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: Arc<str>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl ConversationMessage {
    pub fn system(content: impl Into<Arc<str>>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<Arc<str>>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant_text(content: impl Into<Arc<str>>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tool_calls(content: impl Into<Arc<str>>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, tool_name: impl Into<String>, content: impl Into<Arc<str>>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
        }
    }

    fn plain(role: Role, content: impl Into<Arc<str>>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
        }
    }
}

/// A tool invocation requested by the LLM. `name` is namespaced `server.tool` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments, kept as text per §3 so the controller never needs to re-serialize
    /// what the provider sent.
    pub arguments: String,
}

/// A tool's advertised shape, as returned by [`ToolExecutor::list_tools`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON-Schema text describing accepted parameters.
    pub parameters_schema: String,
}

/// The outcome of executing one [`ToolCall`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub name: String,
    pub content: String,
    pub is_error: bool,
}

/// A single source cited by a [`Chunk::Grounding`] chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundingSource {
    pub uri: String,
    pub title: String,
}

/// One grounded-claim span cited by a [`Chunk::Grounding`] chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundingSupport {
    pub start_idx: usize,
    pub end_idx: usize,
    pub text: String,
    pub chunk_idx: Vec<usize>,
}

/// A piece of a streamed LLM turn. The controller consumes these in order; see
/// [`crate::cloudllm::controller`] for the consumption rules (§4.5 step 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Chunk {
    Text { content: String },
    /// Reasoning trace; may be private to the model, surfaced only through timeline events.
    Thinking { content: String },
    ToolCall { call_id: String, name: String, arguments: String },
    CodeExecution { code: String, result: String },
    Grounding {
        web_search_queries: Vec<String>,
        sources: Vec<GroundingSource>,
        supports: Vec<GroundingSupport>,
        search_entry_point_html: Option<String>,
    },
    Usage { input_tokens: u64, output_tokens: u64, total_tokens: u64, thinking_tokens: u64 },
    Error { message: String, code: String, retryable: bool },
}

/// Aggregate token accounting over a run, the sum of every [`Chunk::Usage`] observed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub thinking_tokens: u64,
}

impl TokenUsage {
    pub fn accumulate(&mut self, input_tokens: u64, output_tokens: u64, total_tokens: u64, thinking_tokens: u64) {
        self.input_tokens += input_tokens;
        self.output_tokens += output_tokens;
        self.total_tokens += total_tokens;
        self.thinking_tokens += thinking_tokens;
    }
}

/// Terminal classification of an [`ExecutionResult`] (§3, §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Active,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// The public outcome of a controller's `execute`, as classified by the [`crate::cloudllm::facade::AgentFacade`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub final_analysis: String,
    pub error: Option<String>,
    pub token_usage: TokenUsage,
}

impl ExecutionResult {
    pub fn completed(final_analysis: impl Into<String>, token_usage: TokenUsage) -> Self {
        Self { status: ExecutionStatus::Completed, final_analysis: final_analysis.into(), error: None, token_usage }
    }

    pub fn failed(error: impl Into<String>, final_analysis: impl Into<String>, token_usage: TokenUsage) -> Self {
        Self { status: ExecutionStatus::Failed, final_analysis: final_analysis.into(), error: Some(error.into()), token_usage }
    }

    pub fn timed_out(error: impl Into<String>, final_analysis: impl Into<String>, token_usage: TokenUsage) -> Self {
        Self { status: ExecutionStatus::TimedOut, final_analysis: final_analysis.into(), error: Some(error.into()), token_usage }
    }

    pub fn cancelled(error: impl Into<String>, token_usage: TokenUsage) -> Self {
        Self { status: ExecutionStatus::Cancelled, final_analysis: String::new(), error: Some(error.into()), token_usage }
    }
}

/// Loop-local mutable state owned by the iteration controller (§3).
///
/// Invariant: `consecutive_timeouts <= MAX_CONSECUTIVE_TIMEOUTS` at loop-entry; reaching the
/// bound aborts the run with [`ExecutionStatus::TimedOut`].
#[derive(Debug, Clone)]
pub struct IterationState {
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub last_interaction_failed: bool,
    pub last_error: Option<String>,
    pub consecutive_timeouts: u32,
}

impl IterationState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            current_iteration: 1,
            max_iterations,
            last_interaction_failed: false,
            last_error: None,
            consecutive_timeouts: 0,
        }
    }

    pub fn is_forced_conclusion_iteration(&self) -> bool {
        self.current_iteration == self.max_iterations
    }

    pub fn record_success(&mut self) {
        self.last_interaction_failed = false;
        self.last_error = None;
        self.consecutive_timeouts = 0;
    }

    pub fn record_failure(&mut self, message: impl Into<String>, is_timeout: bool) {
        self.last_interaction_failed = true;
        self.last_error = Some(message.into());
        if is_timeout {
            self.consecutive_timeouts += 1;
        } else {
            self.consecutive_timeouts = 0;
        }
    }

    pub fn consecutive_timeouts_exceeded(&self) -> bool {
        self.consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS
    }

    pub fn advance(&mut self) {
        self.current_iteration += 1;
    }
}

/// The status + analysis-or-error text of one completed child agent, as delivered by the
/// orchestrator's [`crate::cloudllm::orchestrator::ResultCollector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub execution_id: String,
    pub agent_name: String,
    pub status: ExecutionStatus,
    pub analysis_or_error: String,
}

/// A prior investigation transcript plus the user's current question, carried by chat executions.
#[derive(Debug, Clone)]
pub struct ChatContext {
    pub investigation_context: String,
    pub user_question: String,
    /// Prior (question, answer) exchanges in this chat session, oldest first.
    pub history: Vec<(String, String)>,
}

/// The task a sub-agent was dispatched to perform, plus its parent's execution id.
#[derive(Debug, Clone)]
pub struct SubAgentContext {
    pub task: String,
    pub parent_execution_id: String,
}

/// One entry in the orchestrator's catalog of dispatchable agents (§4.2 sub-agent catalog
/// formatter).
#[derive(Debug, Clone)]
pub struct SubAgentCatalogEntry {
    pub name: String,
    pub description: String,
    pub mcp_tool_servers: Vec<String>,
    pub native_tools: Vec<String>,
}

/// The set of sub-agents an orchestrator execution may dispatch.
pub type SubAgentCatalog = Vec<SubAgentCatalogEntry>;

/// Tool-server id → initialization error, for servers that failed to come up (§4.2 unavailable-
/// servers warning).
pub type FailedServers = HashMap<String, String>;

/// Per-run identity: which session, stage, and execution this is, and which agent (by name and,
/// for parallel stages, index) is running.
#[derive(Debug, Clone)]
pub struct ExecutionIdentity {
    pub session_id: String,
    pub stage_id: String,
    pub execution_id: String,
    pub agent_name: String,
    pub agent_index: usize,
}

/// Everything one controller invocation needs, constructed once by the (out-of-scope) session
/// executor and borrowed for the duration of `execute`.
///
/// Never mutated by the controller after construction except through the service ports
/// (`llm_client`, `tool_executor`, `event_publisher`).
pub struct ExecutionContext {
    pub identity: ExecutionIdentity,
    /// Opaque alert payload, at most [`MAX_ALERT_PAYLOAD_BYTES`].
    pub alert_payload: Vec<u8>,
    pub alert_type: Option<String>,
    pub runbook: String,
    /// Output of a previous chain stage, or empty for the first stage.
    pub chain_context: String,
    pub config: ResolvedConfig,
    pub llm_client: Arc<dyn crate::cloudllm::client_wrapper::LlmClient>,
    pub tool_executor: Arc<dyn ToolExecutor>,
    pub event_publisher: Arc<dyn EventPublisher>,
    pub chat_context: Option<ChatContext>,
    pub sub_agent_context: Option<SubAgentContext>,
    pub sub_agent_catalog: Option<SubAgentCatalog>,
    pub failed_servers: FailedServers,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn alert_payload_as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.alert_payload).ok()
    }
}

/// A single tool parameter extracted from a JSON-Schema `parameters_schema`, used by the prompt
/// builder's tool-catalog formatter (§4.2).
#[derive(Debug, Clone)]
pub struct SchemaParameter {
    pub name: String,
    pub required: bool,
    pub param_type: String,
    pub description: String,
    pub default: Option<Value>,
    pub choices: Option<Vec<Value>>,
}
