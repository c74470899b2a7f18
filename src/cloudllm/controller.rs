//! The iteration controller: the LLM/tool cycle shared by every agent variant (§4.5).
//!
//! Generalizes the teacher's `Agent::send`/`generate_with_tokens` tool loop — stream consumption,
//! transcript append, a bounded iteration count — from a single-shot `send_message` call into the
//! full chunk-stream consumption, failure/timeout/forced-conclusion state machine this spec
//! requires. Variants (investigation, synthesis, scoring, chat, sub-agent, orchestrator) plug in
//! through [`ControllerVariant`] rather than branching on agent type inside the loop (§9
//! "Controller/strategy separation").

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;

use crate::cloudllm::error::{ControllerError, LlmError};
use crate::cloudllm::event::TimelineEvent;
use crate::cloudllm::orchestrator::{OrchestratorRunner, ResultCollector};
use crate::cloudllm::types::{Chunk, ConversationMessage, ExecutionContext, ExecutionResult, IterationState, ToolCall, ToolDefinition, ToolResult, TokenUsage};

/// Tool name the orchestrator variant intercepts to launch a sub-agent (§4.7). Unnamespaced,
/// unlike `server.tool` calls routed through the tool executor.
const DISPATCH_AGENT_TOOL: &str = "dispatch_agent";
/// Tool name the orchestrator variant intercepts to cancel a dispatched sub-agent (§4.7).
const CANCEL_AGENT_TOOL: &str = "cancel_agent";

/// Per-agent-type seed conversation, tool availability, and termination wording, plugged into
/// [`IterationController`] (§9 "Controller/strategy separation").
#[async_trait]
pub trait ControllerVariant: Send + Sync {
    /// Builds the system+user seed messages for a fresh execution.
    async fn build_initial_messages(&self, ctx: &ExecutionContext, tool_catalog_block: &str) -> Vec<ConversationMessage>;

    /// Whether the tool executor should be queried and tools offered to the LLM this turn.
    fn tools_enabled(&self) -> bool {
        true
    }

    /// Scoring bypasses the "mark execution active" persistence step (§4.5 "Scoring agent").
    fn mark_active(&self) -> bool {
        true
    }

    /// Trailing instruction appended to the forced-conclusion prompt.
    fn forced_conclusion_trailing_instruction(&self) -> &str {
        ""
    }

    /// `Some` only for the orchestrator variant (§4.7): exposes `dispatch_agent`/`cancel_agent` as
    /// native tools and drains/waits on sub-agent results between LLM turns.
    fn orchestrator_runner(&self) -> Option<&OrchestratorRunner> {
        None
    }
}

/// The two control tools the orchestrator variant adds to the catalog, ahead of whatever the tool
/// executor itself advertises (§4.7).
fn orchestrator_tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: DISPATCH_AGENT_TOOL.to_string(),
            description: "Dispatch a named sub-agent to perform a task asynchronously. Returns immediately; the \
result arrives later as a user message."
                .to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string", "description": "Sub-agent name, from the available sub-agents list"},
                    "task": {"type": "string", "description": "The task for the sub-agent to perform"}
                },
                "required": ["name", "task"]
            })
            .to_string(),
        },
        ToolDefinition {
            name: CANCEL_AGENT_TOOL.to_string(),
            description: "Cancel a previously dispatched sub-agent execution.".to_string(),
            parameters_schema: serde_json::json!({
                "type": "object",
                "properties": {"execution_id": {"type": "string"}},
                "required": ["execution_id"]
            })
            .to_string(),
        },
    ]
}

/// Any controller the facade can drive — implemented by [`IterationController`] for every
/// variant (§4.6).
#[async_trait]
pub trait Controller: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Option<ExecutionResult>, ControllerError>;
}

/// Drives one execution's LLM/tool cycle to completion (§4.5).
pub struct IterationController<V: ControllerVariant> {
    variant: V,
}

impl<V: ControllerVariant> IterationController<V> {
    pub fn new(variant: V) -> Self {
        Self { variant }
    }

    /// Builds the tool catalog (server tools plus the orchestrator's native control tools, if
    /// any) and its in-text rendering together, so both stay in sync (§4.2, §4.7).
    async fn build_tool_context(&self, ctx: &ExecutionContext) -> (Vec<ToolDefinition>, String) {
        if !self.variant.tools_enabled() {
            return (Vec::new(), String::new());
        }
        let mut defs = ctx.tool_executor.list_tools().await.unwrap_or_default();
        if self.variant.orchestrator_runner().is_some() {
            defs.extend(orchestrator_tool_definitions());
        }
        let catalog_block = crate::cloudllm::prompt_builder::tool_catalog_block(&defs);
        (defs, catalog_block)
    }

    /// Consumes one LLM turn's chunk stream, returning the accumulated assistant text, any
    /// requested tool calls, and the turn's token usage, or a classified error (§4.5 step 4).
    async fn consume_turn(&self, ctx: &ExecutionContext, iteration: u32, mut stream: crate::cloudllm::client_wrapper::ChunkStream) -> Result<TurnOutcome, LlmError> {
        let mut text = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = TokenUsage::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            ctx.event_publisher
                .publish(TimelineEvent::ChunkReceived { execution_id: ctx.identity.execution_id.clone(), iteration, chunk: chunk.clone() })
                .await;

            match chunk {
                Chunk::Text { content } => text.push_str(&content),
                Chunk::Thinking { .. } => {}
                Chunk::ToolCall { call_id, name, arguments } => {
                    ctx.event_publisher
                        .publish(TimelineEvent::ToolCallDispatched {
                            execution_id: ctx.identity.execution_id.clone(),
                            iteration,
                            tool_name: name.clone(),
                            call_id: call_id.clone(),
                        })
                        .await;
                    tool_calls.push(ToolCall { id: call_id, name, arguments });
                }
                Chunk::CodeExecution { .. } | Chunk::Grounding { .. } => {}
                Chunk::Usage { input_tokens, output_tokens, total_tokens, thinking_tokens } => {
                    usage.accumulate(input_tokens, output_tokens, total_tokens, thinking_tokens);
                }
                Chunk::Error { message, code, retryable } => {
                    let message = if code.is_empty() { message } else { format!("{} ({})", message, code) };
                    if retryable {
                        return Err(LlmError::Retryable(message));
                    } else {
                        return Err(LlmError::Fatal(message));
                    }
                }
            }
        }

        Ok(TurnOutcome { text, tool_calls, usage })
    }

    async fn execute_tool_calls(&self, ctx: &ExecutionContext, iteration: u32, transcript: &mut Vec<ConversationMessage>, tool_calls: Vec<ToolCall>) {
        for call in tool_calls {
            let intercepted = if let Some(runner) = self.variant.orchestrator_runner() {
                if call.name == DISPATCH_AGENT_TOOL {
                    Some(dispatch_agent_tool_result(runner, ctx, &call).await)
                } else if call.name == CANCEL_AGENT_TOOL {
                    Some(cancel_agent_tool_result(runner, &call).await)
                } else {
                    None
                }
            } else {
                None
            };
            let from_tool_server = intercepted.is_none();

            let mut result = match intercepted {
                Some(result) => result,
                None => match ctx.tool_executor.execute(&call.name, &call.arguments).await {
                    Ok(result) => result,
                    Err(e) => ToolResult { call_id: call.id.clone(), name: call.name.clone(), content: e.to_string(), is_error: true },
                },
            };

            ctx.event_publisher
                .publish(TimelineEvent::ToolResultReceived { execution_id: ctx.identity.execution_id.clone(), iteration, result: result.clone() })
                .await;

            if from_tool_server && !result.is_error {
                result.content = self.summarize_if_over_budget(ctx, iteration, transcript, &call, &result).await;
            }

            transcript.push(ConversationMessage::tool_result(result.call_id.clone(), result.name.clone(), result.content.clone()));
        }
    }

    /// If the result exceeds the provider's per-tool token budget, replaces it with an
    /// LLM-produced summary and emits `McpToolSummary` following the tool-result event (§4.5
    /// step 6). Falls back to the raw result on any summarization failure or on an unnamespaced
    /// call name — a degraded context beats aborting the run over a summarization hiccup.
    async fn summarize_if_over_budget(&self, ctx: &ExecutionContext, iteration: u32, transcript: &[ConversationMessage], call: &ToolCall, result: &ToolResult) -> String {
        let cap = ctx.config.provider.per_tool_token_cap;
        if cap == 0 {
            return result.content.clone();
        }
        let original_tokens = estimate_tokens(&result.content);
        if original_tokens <= cap {
            return result.content.clone();
        }
        let (server, tool) = match call.name.split_once('.') {
            Some(parts) => parts,
            None => return result.content.clone(),
        };

        let conversation_context = transcript.last().map(|m| m.content.to_string()).unwrap_or_default();
        let (system, user) = crate::cloudllm::prompt_builder::mcp_result_summary_prompt(server, tool, cap, &conversation_context, &result.content);
        let messages = vec![ConversationMessage::system(system), ConversationMessage::user(user)];

        let stream = match ctx.llm_client.generate(&messages, &[]).await {
            Ok(stream) => stream,
            Err(_) => return result.content.clone(),
        };
        let outcome = match self.consume_turn(ctx, iteration, stream).await {
            Ok(outcome) if !outcome.text.is_empty() => outcome,
            _ => return result.content.clone(),
        };

        ctx.event_publisher
            .publish(TimelineEvent::McpToolSummary {
                execution_id: ctx.identity.execution_id.clone(),
                iteration,
                server: server.to_string(),
                tool: tool.to_string(),
                original_tokens,
                summary_tokens: estimate_tokens(&outcome.text),
            })
            .await;

        outcome.text
    }
}

/// Rough client-side token estimate (~4 bytes/token) used only to decide whether a tool result
/// crosses `per_tool_token_cap` before summarizing; the authoritative count always comes from the
/// provider's own `Chunk::Usage` chunks.
fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}

/// Parses `dispatch_agent`'s `{"name": ..., "task": ...}` arguments and routes to the runner
/// (§4.7). Malformed arguments are reported as a tool error, not a controller abort.
async fn dispatch_agent_tool_result(runner: &OrchestratorRunner, parent: &ExecutionContext, call: &ToolCall) -> ToolResult {
    let parsed: Result<Value, _> = serde_json::from_str(&call.arguments);
    let (name, task) = match parsed {
        Ok(value) => (value.get("name").and_then(Value::as_str).map(str::to_string), value.get("task").and_then(Value::as_str).map(str::to_string)),
        Err(_) => (None, None),
    };

    let content = match (name, task) {
        (Some(name), Some(task)) => {
            let (_is_error, message) = runner.dispatch_agent(parent, &name, &task).await;
            message
        }
        _ => format!("invalid {} arguments: expected {{\"name\": ..., \"task\": ...}}", DISPATCH_AGENT_TOOL),
    };

    ToolResult { call_id: call.id.clone(), name: call.name.clone(), content, is_error: false }
}

/// Parses `cancel_agent`'s `{"execution_id": ...}` arguments and routes to the runner (§4.7).
async fn cancel_agent_tool_result(runner: &OrchestratorRunner, call: &ToolCall) -> ToolResult {
    let parsed: Result<Value, _> = serde_json::from_str(&call.arguments);
    let execution_id = parsed.ok().and_then(|v| v.get("execution_id").and_then(Value::as_str).map(str::to_string));

    let content = match execution_id {
        Some(id) => {
            let (_is_error, message) = runner.cancel_agent(&id).await;
            message
        }
        None => format!("invalid {} arguments: expected {{\"execution_id\": ...}}", CANCEL_AGENT_TOOL),
    };

    ToolResult { call_id: call.id.clone(), name: call.name.clone(), content, is_error: false }
}

struct TurnOutcome {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: TokenUsage,
}

impl<V: ControllerVariant> IterationController<V> {
    /// Persistence seam for the "active" status transition (§4.5). A production caller would
    /// invoke the stage service here and map its failure to `ControllerError::Infrastructure`;
    /// out-of-scope external collaborator in this crate, so this stays a no-op. Kept as its own
    /// method, gated on `mark_active()`, so the scoring variant's opt-out has somewhere real to
    /// attach once a concrete implementation exists.
    async fn publish_active_transition(&self, ctx: &ExecutionContext) {
        if !self.variant.mark_active() {
            return;
        }
        let _ = ctx;
    }

    /// Drives the LLM/tool cycle to completion, then unconditionally tears down the orchestrator
    /// runner (if any) and publishes `ExecutionCompleted`, on every return path out of `run` —
    /// success, failure, timeout, or cancellation alike (§4.7 step 3, §6 "timeline-completed").
    async fn execute_and_finalize(&self, ctx: &ExecutionContext) -> Result<Option<ExecutionResult>, ControllerError> {
        let result = self.run(ctx).await;

        if let Some(runner) = self.variant.orchestrator_runner() {
            runner.shutdown().await;
        }

        if let Ok(Some(ref execution_result)) = result {
            ctx.event_publisher
                .publish(TimelineEvent::ExecutionCompleted { execution_id: ctx.identity.execution_id.clone(), token_usage: execution_result.token_usage })
                .await;
        }

        result
    }

    async fn run(&self, ctx: &ExecutionContext) -> Result<Option<ExecutionResult>, ControllerError> {
        self.publish_active_transition(ctx).await;

        let (tool_defs, catalog_block) = self.build_tool_context(ctx).await;
        let mut transcript = self.variant.build_initial_messages(ctx, &catalog_block).await;

        let mut state = IterationState::new(ctx.config.max_iterations);
        let mut total_usage = TokenUsage::default();

        loop {
            let iteration = state.current_iteration;
            ctx.event_publisher.publish(TimelineEvent::IterationStarted { execution_id: ctx.identity.execution_id.clone(), iteration }).await;

            if let Some(collector) = self.variant.orchestrator_runner().map(|r| r.collector()) {
                while let Some(message) = collector.try_drain().await {
                    transcript.push(message);
                }
            }

            let is_forced_conclusion = state.is_forced_conclusion_iteration();
            if is_forced_conclusion {
                ctx.event_publisher.publish(TimelineEvent::ForcedConclusion { execution_id: ctx.identity.execution_id.clone(), iteration }).await;
                transcript.push(ConversationMessage::user(crate::cloudllm::prompt_builder::forced_conclusion_prompt(
                    iteration,
                    self.variant.forced_conclusion_trailing_instruction(),
                )));
            }

            let deadline = Duration::from_secs(ctx.config.iteration_timeout_secs);
            let turn_tools = if is_forced_conclusion { Vec::new() } else { tool_defs.clone() };

            let stream_result = tokio::time::timeout(deadline, ctx.llm_client.generate(&transcript, &turn_tools)).await;

            let stream = match stream_result {
                Err(_elapsed) => {
                    state.record_failure("iteration deadline exceeded", true);
                    ctx.event_publisher
                        .publish(TimelineEvent::IterationFailed {
                            execution_id: ctx.identity.execution_id.clone(),
                            iteration,
                            message: "deadline exceeded".to_string(),
                            is_timeout: true,
                        })
                        .await;
                    if state.consecutive_timeouts_exceeded() {
                        return Ok(Some(ExecutionResult::timed_out("consecutive iteration timeouts exceeded", assistant_text_so_far(&transcript), total_usage)));
                    }
                    state.advance();
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(stream)) => stream,
            };

            let outcome = match self.consume_turn(ctx, iteration, stream).await {
                Ok(outcome) => outcome,
                Err(LlmError::Retryable(msg)) => {
                    state.record_failure(msg.clone(), false);
                    ctx.event_publisher
                        .publish(TimelineEvent::IterationFailed { execution_id: ctx.identity.execution_id.clone(), iteration, message: msg, is_timeout: false })
                        .await;
                    if is_forced_conclusion {
                        // No next iteration to retry into: terminate with whatever text had
                        // accumulated before this error (possibly empty).
                        return Ok(Some(ExecutionResult::completed(String::new(), total_usage)));
                    }
                    state.advance();
                    continue;
                }
                Err(LlmError::Fatal(msg)) => {
                    if log::log_enabled!(log::Level::Error) {
                        log::error!("IterationController::execute({}): fatal LLM error at iteration {}: {}", ctx.identity.execution_id, iteration, msg);
                    }
                    return Ok(Some(ExecutionResult::failed(msg, assistant_text_so_far(&transcript), total_usage)));
                }
                Err(LlmError::DeadlineExceeded) => return Err(ControllerError::DeadlineExceeded),
                Err(LlmError::Cancelled) => return Err(ControllerError::Cancelled),
            };

            total_usage.accumulate(outcome.usage.input_tokens, outcome.usage.output_tokens, outcome.usage.total_tokens, outcome.usage.thinking_tokens);
            state.record_success();

            if is_forced_conclusion {
                // Tool calls on the forced iteration are discarded; terminate with accumulated text.
                return Ok(Some(ExecutionResult::completed(outcome.text, total_usage)));
            }

            if outcome.tool_calls.is_empty() {
                if let Some(collector) = self.variant.orchestrator_runner().map(|r| r.collector()) {
                    if collector.has_pending() {
                        transcript.push(ConversationMessage::assistant_text(outcome.text));
                        match collector.wait().await {
                            Ok(message) => {
                                transcript.push(message);
                                state.advance();
                                continue;
                            }
                            Err(ControllerError::Cancelled) => return Err(ControllerError::Cancelled),
                            Err(e) => return Err(e),
                        }
                    }
                }
                return Ok(Some(ExecutionResult::completed(outcome.text, total_usage)));
            }

            transcript.push(ConversationMessage::assistant_with_tool_calls(outcome.text, outcome.tool_calls.clone()));
            self.execute_tool_calls(ctx, iteration, &mut transcript, outcome.tool_calls).await;

            state.advance();
        }
    }
}

#[async_trait]
impl<V: ControllerVariant> Controller for IterationController<V> {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Option<ExecutionResult>, ControllerError> {
        self.execute_and_finalize(ctx).await
    }
}

fn assistant_text_so_far(transcript: &[ConversationMessage]) -> String {
    transcript
        .iter()
        .rev()
        .find(|m| matches!(m.role, crate::cloudllm::types::Role::Assistant))
        .map(|m| m.content.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::client_wrapper::{ChunkStream, LlmClient};
    use crate::cloudllm::config::{AgentType, ProviderDescriptor, ResolvedConfig};
    use crate::cloudllm::event::{NullEventPublisher, RecordingEventPublisher};
    use crate::cloudllm::tool_protocol::ToolExecutor;
    use crate::cloudllm::types::{ExecutionIdentity, ExecutionStatus, ToolDefinition, ToolResult};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct ScriptedClient {
        turns: std::sync::Mutex<Vec<Vec<Result<Chunk, LlmError>>>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(turns: Vec<Vec<Result<Chunk, LlmError>>>) -> Self {
            Self { turns: std::sync::Mutex::new(turns), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn generate(&self, _messages: &[ConversationMessage], _tools: &[ToolDefinition]) -> Result<ChunkStream, LlmError> {
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                return Err(LlmError::Fatal("no more scripted turns".to_string()));
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            let turn = turns.remove(0);
            Ok(Box::pin(futures_util::stream::iter(turn)))
        }
    }

    struct NoTools;

    #[async_trait]
    impl ToolExecutor for NoTools {
        async fn execute(&self, _tool_name: &str, _arguments: &str) -> Result<ToolResult, crate::cloudllm::error::ToolExecError> {
            unreachable!("no tools configured")
        }

        async fn list_tools(&self) -> Result<Vec<ToolDefinition>, crate::cloudllm::error::ToolExecError> {
            Ok(Vec::new())
        }
    }

    struct EchoTool;

    #[async_trait]
    impl ToolExecutor for EchoTool {
        async fn execute(&self, tool_name: &str, arguments: &str) -> Result<ToolResult, crate::cloudllm::error::ToolExecError> {
            Ok(ToolResult { call_id: String::new(), name: tool_name.to_string(), content: format!("result for {}", arguments), is_error: false })
        }

        async fn list_tools(&self) -> Result<Vec<ToolDefinition>, crate::cloudllm::error::ToolExecError> {
            Ok(vec![ToolDefinition { name: "k8s.get_pods".to_string(), description: "d".to_string(), parameters_schema: "{}".to_string() }])
        }
    }

    struct InvestigationVariant;

    #[async_trait]
    impl ControllerVariant for InvestigationVariant {
        async fn build_initial_messages(&self, ctx: &ExecutionContext, _tool_catalog_block: &str) -> Vec<ConversationMessage> {
            vec![ConversationMessage::system(crate::cloudllm::prompt_builder::investigation_system_prompt(ctx, &[])), ConversationMessage::user(crate::cloudllm::prompt_builder::investigation_user_prompt(ctx))]
        }
    }

    fn ctx_with(tool_executor: Arc<dyn ToolExecutor>, llm_client: Arc<dyn LlmClient>, max_iterations: u32) -> ExecutionContext {
        ExecutionContext {
            identity: ExecutionIdentity { session_id: "s1".to_string(), stage_id: "st1".to_string(), execution_id: "e1".to_string(), agent_name: "InvestigatorAgent".to_string(), agent_index: 0 },
            alert_payload: b"{}".to_vec(),
            alert_type: Some("PodCrashLoop".to_string()),
            runbook: String::new(),
            chain_context: String::new(),
            config: ResolvedConfig {
                agent_name: "InvestigatorAgent".to_string(),
                agent_type: AgentType::Default,
                llm_backend: "langchain".to_string(),
                provider: ProviderDescriptor { name: "openai".to_string(), model_id: "gpt-4o".to_string(), credential_env_var: "OPENAI_API_KEY".to_string(), base_url: "https://api.openai.com".to_string(), per_tool_token_cap: 4000, native_tools: Vec::new() },
                max_iterations,
                iteration_timeout_secs: 120,
                tool_servers: vec!["k8s".to_string()],
                custom_instructions: String::new(),
            },
            llm_client,
            tool_executor,
            event_publisher: Arc::new(NullEventPublisher),
            chat_context: None,
            sub_agent_context: None,
            sub_agent_catalog: None,
            failed_servers: HashMap::new(),
            started_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn single_iteration_completes_with_no_tool_calls() {
        let client = Arc::new(ScriptedClient::new(vec![vec![Ok(Chunk::Text { content: "All clear.".to_string() }), Ok(Chunk::Usage { input_tokens: 10, output_tokens: 5, total_tokens: 15, thinking_tokens: 0 })]]));
        let ctx = ctx_with(Arc::new(NoTools), client, 20);
        let controller = IterationController::new(InvestigationVariant);

        let result = controller.execute(&ctx).await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.final_analysis, "All clear.");
        assert_eq!(result.token_usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn tool_call_triggers_second_iteration_and_completes() {
        let client = Arc::new(ScriptedClient::new(vec![
            vec![Ok(Chunk::ToolCall { call_id: "c1".to_string(), name: "k8s.get_pods".to_string(), arguments: "{\"ns\":\"prod\"}".to_string() })],
            vec![Ok(Chunk::Text { content: "Found a crash-looping pod.".to_string() })],
        ]));
        let ctx = ctx_with(Arc::new(EchoTool), client, 20);
        let controller = IterationController::new(InvestigationVariant);

        let result = controller.execute(&ctx).await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.final_analysis, "Found a crash-looping pod.");
    }

    #[tokio::test]
    async fn iteration_budget_exhaustion_forces_conclusion() {
        let mut turns = Vec::new();
        for _ in 0..3 {
            turns.push(vec![Ok(Chunk::ToolCall { call_id: "c1".to_string(), name: "k8s.get_pods".to_string(), arguments: "{}".to_string() })]);
        }
        turns.push(vec![Ok(Chunk::Text { content: "Partial findings only.".to_string() })]);
        let client = Arc::new(ScriptedClient::new(turns));
        let ctx = ctx_with(Arc::new(EchoTool), client, 4);
        let controller = IterationController::new(InvestigationVariant);

        let result = controller.execute(&ctx).await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.final_analysis, "Partial findings only.");
    }

    #[tokio::test]
    async fn consecutive_timeouts_abort_with_timed_out() {
        struct NeverRespondsClient;
        #[async_trait]
        impl LlmClient for NeverRespondsClient {
            async fn generate(&self, _messages: &[ConversationMessage], _tools: &[ToolDefinition]) -> Result<ChunkStream, LlmError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!()
            }
        }
        let ctx = ctx_with(Arc::new(NoTools), Arc::new(NeverRespondsClient), 20);
        let ctx = ExecutionContext { config: ResolvedConfig { iteration_timeout_secs: 0, ..ctx.config }, ..ctx };
        let controller = IterationController::new(InvestigationVariant);

        let result = controller.execute(&ctx).await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::TimedOut);
    }

    #[tokio::test]
    async fn fatal_llm_error_aborts_with_failed() {
        let client = Arc::new(ScriptedClient::new(vec![vec![Ok(Chunk::Error { message: "invalid api key".to_string(), code: "auth".to_string(), retryable: false })]]));
        let ctx = ctx_with(Arc::new(NoTools), client, 20);
        let controller = IterationController::new(InvestigationVariant);

        let result = controller.execute(&ctx).await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn retryable_error_then_success_completes_the_run() {
        let client = Arc::new(ScriptedClient::new(vec![
            vec![Ok(Chunk::Error { message: "rate limited".to_string(), code: "429".to_string(), retryable: true })],
            vec![Ok(Chunk::Text { content: "Recovered.".to_string() })],
        ]));
        let ctx = ctx_with(Arc::new(NoTools), client, 20);
        let controller = IterationController::new(InvestigationVariant);

        let result = controller.execute(&ctx).await.unwrap().unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.final_analysis, "Recovered.");
    }

    #[tokio::test]
    async fn chunk_events_are_published_in_order() {
        let client = Arc::new(ScriptedClient::new(vec![vec![Ok(Chunk::Text { content: "hi".to_string() })]]));
        let mut ctx = ctx_with(Arc::new(NoTools), client, 20);
        let recorder = Arc::new(RecordingEventPublisher::new());
        ctx.event_publisher = recorder.clone();
        let controller = IterationController::new(InvestigationVariant);

        controller.execute(&ctx).await.unwrap();
        let events = recorder.events().await;
        assert!(matches!(events[0], TimelineEvent::IterationStarted { .. }));
    }
}
