//! The six literal end-to-end scenarios (§8), exercised through the public facade/factory API
//! rather than against the controller directly, the way the teacher's `tests/agent_tests.rs`
//! exercises `Agent` rather than its internals.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use agentcore::cloudllm::client_wrapper::ChunkStream;
use agentcore::cloudllm::config::{AgentType, ProviderDescriptor, ResolvedConfig};
use agentcore::cloudllm::error::{LlmError, ToolExecError};
use agentcore::cloudllm::facade::ControllerFactory;
use agentcore::cloudllm::types::{
    Chunk, ConversationMessage, ExecutionContext, ExecutionIdentity, ExecutionStatus, SubAgentCatalogEntry, ToolDefinition, ToolResult,
};
use agentcore::{AgentFacade, LlmClient, NullEventPublisher, ToolExecutor};

fn provider() -> ProviderDescriptor {
    ProviderDescriptor {
        name: "openai".to_string(),
        model_id: "gpt-4o".to_string(),
        credential_env_var: "OPENAI_API_KEY".to_string(),
        base_url: "https://api.openai.com".to_string(),
        per_tool_token_cap: 4000,
        native_tools: Vec::new(),
    }
}

fn base_config(agent_type: AgentType, max_iterations: u32) -> ResolvedConfig {
    ResolvedConfig {
        agent_name: "InvestigatorAgent".to_string(),
        agent_type,
        llm_backend: "langchain".to_string(),
        provider: provider(),
        max_iterations,
        iteration_timeout_secs: 120,
        tool_servers: Vec::new(),
        custom_instructions: String::new(),
    }
}

fn base_ctx(config: ResolvedConfig, llm_client: Arc<dyn LlmClient>, tool_executor: Arc<dyn ToolExecutor>) -> ExecutionContext {
    ExecutionContext {
        identity: ExecutionIdentity { session_id: "s1".to_string(), stage_id: "st1".to_string(), execution_id: "e1".to_string(), agent_name: "InvestigatorAgent".to_string(), agent_index: 0 },
        alert_payload: br#"{"description":"CPU 99%"}"#.to_vec(),
        alert_type: Some("HighCpu".to_string()),
        runbook: String::new(),
        chain_context: String::new(),
        config,
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

struct NoTools;

#[async_trait]
impl ToolExecutor for NoTools {
    async fn execute(&self, _tool_name: &str, _arguments: &str) -> Result<ToolResult, ToolExecError> {
        unreachable!("no tools configured")
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolExecError> {
        Ok(Vec::new())
    }
}

struct PodsListTool;

#[async_trait]
impl ToolExecutor for PodsListTool {
    async fn execute(&self, tool_name: &str, _arguments: &str) -> Result<ToolResult, ToolExecError> {
        Ok(ToolResult {
            call_id: String::new(),
            name: tool_name.to_string(),
            content: r#"{"items":[{"name":"web-1","phase":"CrashLoopBackOff"}]}"#.to_string(),
            is_error: false,
        })
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolExecError> {
        Ok(vec![ToolDefinition { name: "k8s.pods_list".to_string(), description: "List pods".to_string(), parameters_schema: "{}".to_string() }])
    }
}

struct ScriptedClient {
    turns: AsyncMutex<Vec<Vec<Result<Chunk, LlmError>>>>,
}

impl ScriptedClient {
    fn new(turns: Vec<Vec<Result<Chunk, LlmError>>>) -> Self {
        Self { turns: AsyncMutex::new(turns) }
    }
}

#[async_trait]
impl LlmClient for ScriptedClient {
    async fn generate(&self, _messages: &[ConversationMessage], _tools: &[ToolDefinition]) -> Result<ChunkStream, LlmError> {
        let mut turns = self.turns.lock().await;
        if turns.is_empty() {
            return Err(LlmError::Fatal("no more scripted turns".to_string()));
        }
        let turn = turns.remove(0);
        Ok(Box::pin(futures_util::stream::iter(turn)))
    }
}

struct NeverRespondsClient;

#[async_trait]
impl LlmClient for NeverRespondsClient {
    async fn generate(&self, _messages: &[ConversationMessage], _tools: &[ToolDefinition]) -> Result<ChunkStream, LlmError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        unreachable!()
    }
}

#[tokio::test]
async fn scenario_1_standard_single_iteration_completion() {
    let client = Arc::new(ScriptedClient::new(vec![vec![
        Ok(Chunk::Text { content: "Root cause: CPU saturation; recommend scale-out.".to_string() }),
        Ok(Chunk::Usage { input_tokens: 100, output_tokens: 50, total_tokens: 150, thinking_tokens: 0 }),
    ]]));
    let ctx = base_ctx(base_config(AgentType::Default, 20), client, Arc::new(NoTools));

    let controller = ControllerFactory::build(&ctx);
    let result = AgentFacade::new(controller).execute(&ctx).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.final_analysis, "Root cause: CPU saturation; recommend scale-out.");
    assert_eq!(result.token_usage.total_tokens, 150);
}

#[tokio::test]
async fn scenario_2_two_iteration_tool_use() {
    let client = Arc::new(ScriptedClient::new(vec![
        vec![Ok(Chunk::ToolCall { call_id: "c1".to_string(), name: "k8s.pods_list".to_string(), arguments: r#"{"namespace":"prod"}"#.to_string() })],
        vec![Ok(Chunk::Text { content: "web-1 crash-looping; investigate logs.".to_string() })],
    ]));
    let mut config = base_config(AgentType::Default, 20);
    config.tool_servers = vec!["k8s".to_string()];
    let ctx = base_ctx(config, client, Arc::new(PodsListTool));

    let controller = ControllerFactory::build(&ctx);
    let result = AgentFacade::new(controller).execute(&ctx).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.final_analysis, "web-1 crash-looping; investigate logs.");
}

#[tokio::test]
async fn scenario_3_iteration_budget_exhausted() {
    let client = Arc::new(ScriptedClient::new(vec![
        vec![Ok(Chunk::ToolCall { call_id: "c1".to_string(), name: "k8s.pods_list".to_string(), arguments: "{}".to_string() })],
        vec![Ok(Chunk::ToolCall { call_id: "c2".to_string(), name: "k8s.pods_list".to_string(), arguments: "{}".to_string() })],
        vec![Ok(Chunk::Text { content: "Partial analysis: ...".to_string() })],
    ]));
    let mut config = base_config(AgentType::Default, 2);
    config.tool_servers = vec!["k8s".to_string()];
    let ctx = base_ctx(config, client, Arc::new(PodsListTool));

    let controller = ControllerFactory::build(&ctx);
    let result = AgentFacade::new(controller).execute(&ctx).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.final_analysis, "Partial analysis: ...");
}

#[tokio::test]
async fn scenario_4_double_timeout_abort() {
    let mut config = base_config(AgentType::Default, 20);
    config.iteration_timeout_secs = 0;
    let ctx = base_ctx(config, Arc::new(NeverRespondsClient), Arc::new(NoTools));

    let controller = ControllerFactory::build(&ctx);
    let result = AgentFacade::new(controller).execute(&ctx).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::TimedOut);
}

#[tokio::test]
async fn scenario_5_non_retryable_llm_error_mid_stream() {
    let client = Arc::new(ScriptedClient::new(vec![vec![
        Ok(Chunk::Text { content: "start…".to_string() }),
        Ok(Chunk::Error { message: "unauthorized".to_string(), code: "401".to_string(), retryable: false }),
    ]]));
    let ctx = base_ctx(base_config(AgentType::Default, 20), client, Arc::new(NoTools));

    let controller = ControllerFactory::build(&ctx);
    let result = AgentFacade::new(controller).execute(&ctx).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.error.as_ref().unwrap().contains("401"));
}

#[tokio::test]
async fn scenario_6_orchestrator_parallel_fan_out() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Child executions share the parent's `llm_client` (per `OrchestratorRunner::dispatch_agent`
    // cloning it into the child context), so one client must answer every caller. It routes on
    // message content rather than call count: a sub-agent's transcript always carries its task
    // text via `sub_agent_user_prompt`, so the three roles (LogAgent, MetricAgent, orchestrator)
    // never produce ambiguous input.
    struct RoutingClient {
        orchestrator_calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for RoutingClient {
        async fn generate(&self, messages: &[ConversationMessage], _tools: &[ToolDefinition]) -> Result<ChunkStream, LlmError> {
            let last_user =
                messages.iter().rev().find(|m| matches!(m.role, agentcore::cloudllm::types::Role::User)).map(|m| m.content.to_string()).unwrap_or_default();

            if last_user.contains("check logs") {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                return Ok(Box::pin(futures_util::stream::iter(vec![Ok(Chunk::Text { content: "LogAgent findings: CPU saturation in logs.".to_string() })])));
            }
            if last_user.contains("check metrics") {
                tokio::time::sleep(std::time::Duration::from_millis(25)).await;
                return Ok(Box::pin(futures_util::stream::iter(vec![Ok(Chunk::Text { content: "MetricAgent findings: CPU at 99%.".to_string() })])));
            }

            let both_delivered =
                messages.iter().any(|m| m.content.contains("[Sub-agent completed] LogAgent")) && messages.iter().any(|m| m.content.contains("[Sub-agent completed] MetricAgent"));
            if both_delivered {
                return Ok(Box::pin(futures_util::stream::iter(vec![Ok(Chunk::Text { content: "Combined: both agents agree on CPU saturation.".to_string() })])));
            }

            let call = self.orchestrator_calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Ok(Box::pin(futures_util::stream::iter(vec![
                    Ok(Chunk::ToolCall { call_id: "c1".to_string(), name: "dispatch_agent".to_string(), arguments: r#"{"name":"LogAgent","task":"check logs"}"#.to_string() }),
                    Ok(Chunk::ToolCall { call_id: "c2".to_string(), name: "dispatch_agent".to_string(), arguments: r#"{"name":"MetricAgent","task":"check metrics"}"#.to_string() }),
                ])))
            } else {
                // No tool calls and nothing final yet: the orchestrator must be waiting on its
                // still-pending sub-agents (§8 "Result-driven progress").
                Ok(Box::pin(futures_util::stream::iter(vec![Ok(Chunk::Text { content: String::new() })])))
            }
        }
    }

    let mut config = base_config(AgentType::Orchestrator, 20);
    config.agent_name = "Orchestrator".to_string();
    let mut ctx = base_ctx(config, Arc::new(RoutingClient { orchestrator_calls: AtomicUsize::new(0) }), Arc::new(NoTools));
    ctx.sub_agent_catalog = Some(vec![
        SubAgentCatalogEntry { name: "LogAgent".to_string(), description: "Checks logs".to_string(), mcp_tool_servers: Vec::new(), native_tools: Vec::new() },
        SubAgentCatalogEntry { name: "MetricAgent".to_string(), description: "Checks metrics".to_string(), mcp_tool_servers: Vec::new(), native_tools: Vec::new() },
    ]);

    let controller = ControllerFactory::build(&ctx);
    let result = AgentFacade::new(controller).execute(&ctx).await.unwrap();

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.final_analysis, "Combined: both agents agree on CPU saturation.");
}
