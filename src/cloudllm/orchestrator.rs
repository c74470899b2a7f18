//! Sub-agent dispatch and non-blocking result collection for the orchestrator variant (§4.7).
//!
//! Generalizes the teacher's `tokio::spawn`-per-agent fan-out in `orchestration.rs`
//! (`execute_parallel`) from a blocking per-round barrier — where the orchestrator awaits every
//! child before starting the next round — into a bounded producer/consumer queue the controller
//! drains opportunistically, per the Design Note favouring a queue over callback-style delivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::cloudllm::error::ControllerError;
use crate::cloudllm::types::{
    ConversationMessage, ExecutionContext, ExecutionIdentity, ExecutionResult, ExecutionStatus, SubAgentCatalog, SubAgentContext, SubAgentResult,
};

/// Runs one child agent execution to completion. Implemented by whatever constructs controllers
/// for a resolved config (the facade's `ControllerFactory` in a full deployment); kept as a trait
/// here so `orchestrator.rs` never depends on `facade.rs` directly.
#[async_trait]
pub trait ChildExecutor: Send + Sync {
    async fn run_child(&self, ctx: ExecutionContext) -> Result<Option<ExecutionResult>, ControllerError>;
}

/// Per-child cancellation handle: a flag plus a `Notify` so a blocked child can wake immediately
/// on cancellation without polling (teacher has no analogue; built in the same
/// zero-new-dependency spirit as the rest of this module — no `tokio-util::CancellationToken`).
#[derive(Clone)]
struct ChildHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

/// Non-blocking result delivery port exposed to the iteration controller (§4.7 "Result collector
/// contract").
pub struct ResultCollector {
    receiver: Mutex<mpsc::Receiver<SubAgentResult>>,
    pending: Arc<AtomicUsize>,
    shutdown: Arc<Notify>,
}

impl ResultCollector {
    /// Non-blocking dequeue of one ready result, formatted as a transcript-ready user message.
    /// Returns `None` immediately if nothing is ready — never blocks, never mutates on `None`.
    pub async fn try_drain(&self) -> Option<ConversationMessage> {
        let mut receiver = self.receiver.lock().await;
        match receiver.try_recv() {
            Ok(result) => Some(format_result(&result)),
            Err(_) => None,
        }
    }

    /// Blocks until a result is ready or cancellation is signalled.
    pub async fn wait(&self) -> Result<ConversationMessage, ControllerError> {
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            maybe = receiver.recv() => maybe.map(|r| format_result(&r)).ok_or(ControllerError::Cancelled),
            _ = self.shutdown.notified() => Err(ControllerError::Cancelled),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }
}

fn format_result(result: &SubAgentResult) -> ConversationMessage {
    let prefix = match result.status {
        ExecutionStatus::Completed => "[Sub-agent completed]",
        _ => "[Sub-agent failed/cancelled]",
    };
    ConversationMessage::user(format!("{} {}: {}", prefix, result.agent_name, result.analysis_or_error))
}

/// Owns the dispatch table, the bounded result channel, and per-child cancellation. One instance
/// per orchestrator execution.
pub struct OrchestratorRunner {
    catalog: SubAgentCatalog,
    child_executor: Arc<dyn ChildExecutor>,
    sender: mpsc::Sender<SubAgentResult>,
    collector: ResultCollector,
    pending: Arc<AtomicUsize>,
    children: Mutex<HashMap<String, ChildHandle>>,
    shutdown: Arc<Notify>,
    shutting_down: Arc<AtomicBool>,
}

impl OrchestratorRunner {
    /// `buffer` must be at least the catalog size so a producer (child task) never blocks
    /// delivering its result (§5 "Resource ownership").
    pub fn new(catalog: SubAgentCatalog, child_executor: Arc<dyn ChildExecutor>, buffer: usize) -> Self {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(Notify::new());
        Self {
            catalog,
            child_executor,
            sender,
            collector: ResultCollector { receiver: Mutex::new(receiver), pending: pending.clone(), shutdown: shutdown.clone() },
            pending,
            children: Mutex::new(HashMap::new()),
            shutdown,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn collector(&self) -> &ResultCollector {
        &self.collector
    }

    /// `dispatch_agent(name, task)` (§4.7). Looks up `name` in the catalog; on success, spawns a
    /// background worker and returns immediately with the assigned execution id.
    pub async fn dispatch_agent(&self, parent: &ExecutionContext, name: &str, task: &str) -> (bool, String) {
        let entry = match self.catalog.iter().find(|e| e.name == name) {
            Some(entry) => entry.clone(),
            None => return (true, format!("no such sub-agent: {}", name)),
        };

        if log::log_enabled!(log::Level::Info) {
            log::info!("OrchestratorRunner::dispatch_agent: dispatching '{}' for parent {}", name, parent.identity.execution_id);
        }

        let exec_id = format!("{}-sub-{}", parent.identity.execution_id, uuid::Uuid::new_v4());
        let cancelled = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        self.children.lock().await.insert(exec_id.clone(), ChildHandle { cancelled: cancelled.clone(), notify: notify.clone() });
        self.pending.fetch_add(1, Ordering::SeqCst);

        let child_ctx = ExecutionContext {
            identity: ExecutionIdentity {
                session_id: parent.identity.session_id.clone(),
                stage_id: parent.identity.stage_id.clone(),
                execution_id: exec_id.clone(),
                agent_name: entry.name.clone(),
                agent_index: 0,
            },
            alert_payload: parent.alert_payload.clone(),
            alert_type: parent.alert_type.clone(),
            runbook: parent.runbook.clone(),
            chain_context: parent.chain_context.clone(),
            config: crate::cloudllm::config::ResolvedConfig {
                agent_name: entry.name.clone(),
                agent_type: crate::cloudllm::config::AgentType::Default,
                llm_backend: parent.config.llm_backend.clone(),
                provider: parent.config.provider.clone(),
                max_iterations: parent.config.max_iterations,
                iteration_timeout_secs: parent.config.iteration_timeout_secs,
                tool_servers: entry.mcp_tool_servers.clone(),
                custom_instructions: String::new(),
            },
            llm_client: parent.llm_client.clone(),
            tool_executor: parent.tool_executor.clone(),
            event_publisher: parent.event_publisher.clone(),
            chat_context: None,
            sub_agent_context: Some(SubAgentContext { task: task.to_string(), parent_execution_id: parent.identity.execution_id.clone() }),
            sub_agent_catalog: None,
            failed_servers: parent.failed_servers.clone(),
            started_at: chrono::Utc::now(),
        };

        let child_executor = self.child_executor.clone();
        let sender = self.sender.clone();
        let pending = self.pending.clone();
        let agent_name = entry.name.clone();
        let exec_id_for_worker = exec_id.clone();

        tokio::spawn(async move {
            let outcome = child_executor.run_child(child_ctx).await;
            let sub_result = match outcome {
                Ok(Some(result)) if result.status == ExecutionStatus::Completed => {
                    SubAgentResult { execution_id: exec_id_for_worker, agent_name, status: ExecutionStatus::Completed, analysis_or_error: result.final_analysis }
                }
                Ok(Some(result)) => SubAgentResult {
                    execution_id: exec_id_for_worker,
                    agent_name,
                    status: result.status,
                    analysis_or_error: result.error.unwrap_or_default(),
                },
                Ok(None) => SubAgentResult {
                    execution_id: exec_id_for_worker,
                    agent_name,
                    status: ExecutionStatus::Failed,
                    analysis_or_error: "controller returned no result".to_string(),
                },
                Err(e) => SubAgentResult { execution_id: exec_id_for_worker, agent_name, status: ExecutionStatus::Failed, analysis_or_error: e.to_string() },
            };
            if sub_result.status != ExecutionStatus::Completed && log::log_enabled!(log::Level::Warn) {
                log::warn!("OrchestratorRunner: sub-agent '{}' finished as {:?}: {}", sub_result.agent_name, sub_result.status, sub_result.analysis_or_error);
            }
            pending.fetch_sub(1, Ordering::SeqCst);
            let _ = sender.send(sub_result).await;
        });

        (false, exec_id)
    }

    /// `cancel_agent(execution_id)` (§4.7). Signals the child's cancellation flag; the child
    /// itself is responsible for observing it at its own suspension points.
    pub async fn cancel_agent(&self, execution_id: &str) -> (bool, String) {
        match self.children.lock().await.get(execution_id) {
            Some(handle) => {
                handle.cancelled.store(true, Ordering::SeqCst);
                handle.notify.notify_waiters();
                if log::log_enabled!(log::Level::Info) {
                    log::info!("OrchestratorRunner::cancel_agent: cancellation requested for {}", execution_id);
                }
                (false, format!("cancellation requested for {}", execution_id))
            }
            None => (true, format!("unknown execution id: {}", execution_id)),
        }
    }

    /// Cancels all outstanding children and drains the results channel so no worker task leaks
    /// past the orchestrator's own return (§4.7 "Terminal cleanup").
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let children = self.children.lock().await;
        for handle in children.values() {
            handle.cancelled.store(true, Ordering::SeqCst);
            handle.notify.notify_waiters();
        }
        self.shutdown.notify_waiters();
        let mut receiver = self.collector.receiver.lock().await;
        while receiver.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::types::{SubAgentCatalogEntry, TokenUsage};

    struct ImmediateSuccess;

    #[async_trait]
    impl ChildExecutor for ImmediateSuccess {
        async fn run_child(&self, ctx: ExecutionContext) -> Result<Option<ExecutionResult>, ControllerError> {
            Ok(Some(ExecutionResult::completed(format!("done: {}", ctx.identity.agent_name), TokenUsage::default())))
        }
    }

    struct ImmediateFailure;

    #[async_trait]
    impl ChildExecutor for ImmediateFailure {
        async fn run_child(&self, _ctx: ExecutionContext) -> Result<Option<ExecutionResult>, ControllerError> {
            Err(ControllerError::Other("boom".to_string()))
        }
    }

    fn catalog() -> SubAgentCatalog {
        vec![SubAgentCatalogEntry { name: "LogAnalyst".to_string(), description: "d".to_string(), mcp_tool_servers: vec!["logs".to_string()], native_tools: Vec::new() }]
    }

    fn parent_ctx() -> ExecutionContext {
        ExecutionContext {
            identity: ExecutionIdentity { session_id: "s1".to_string(), stage_id: "st1".to_string(), execution_id: "parent1".to_string(), agent_name: "Orchestrator".to_string(), agent_index: 0 },
            alert_payload: Vec::new(),
            alert_type: None,
            runbook: String::new(),
            chain_context: String::new(),
            config: crate::cloudllm::config::ResolvedConfig {
                agent_name: "Orchestrator".to_string(),
                agent_type: crate::cloudllm::config::AgentType::Orchestrator,
                llm_backend: "langchain".to_string(),
                provider: crate::cloudllm::config::ProviderDescriptor {
                    name: "openai".to_string(),
                    model_id: "gpt-4o".to_string(),
                    credential_env_var: "OPENAI_API_KEY".to_string(),
                    base_url: "https://api.openai.com".to_string(),
                    per_tool_token_cap: 4000,
                    native_tools: Vec::new(),
                },
                max_iterations: 20,
                iteration_timeout_secs: 120,
                tool_servers: Vec::new(),
                custom_instructions: String::new(),
            },
            llm_client: Arc::new(crate::cloudllm::client_wrapper::HttpLlmClient::new("http://unused", "unused", "unused")),
            tool_executor: Arc::new(crate::cloudllm::tool_protocol::RoutedToolExecutor::new(HashMap::new())),
            event_publisher: Arc::new(crate::cloudllm::event::NullEventPublisher),
            chat_context: None,
            sub_agent_context: None,
            sub_agent_catalog: Some(catalog()),
            failed_servers: HashMap::new(),
            started_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn dispatch_unknown_agent_returns_error_without_spawning() {
        let runner = OrchestratorRunner::new(catalog(), Arc::new(ImmediateSuccess), 4);
        let (is_error, _) = runner.dispatch_agent(&parent_ctx(), "NoSuchAgent", "investigate").await;
        assert!(is_error);
        assert!(!runner.collector().has_pending());
    }

    #[tokio::test]
    async fn dispatch_known_agent_delivers_completed_result() {
        let runner = OrchestratorRunner::new(catalog(), Arc::new(ImmediateSuccess), 4);
        let (is_error, _exec_id) = runner.dispatch_agent(&parent_ctx(), "LogAnalyst", "check logs").await;
        assert!(!is_error);

        let message = runner.collector().wait().await.unwrap();
        assert!(message.content.contains("[Sub-agent completed]"));
        assert!(message.content.contains("LogAnalyst"));
    }

    #[tokio::test]
    async fn try_drain_returns_none_when_nothing_ready() {
        let runner = OrchestratorRunner::new(catalog(), Arc::new(ImmediateSuccess), 4);
        assert!(runner.collector().try_drain().await.is_none());
    }

    #[tokio::test]
    async fn failed_child_execution_is_reported_not_propagated() {
        let runner = OrchestratorRunner::new(catalog(), Arc::new(ImmediateFailure), 4);
        runner.dispatch_agent(&parent_ctx(), "LogAnalyst", "check logs").await;
        let message = runner.collector().wait().await.unwrap();
        assert!(message.content.contains("[Sub-agent failed/cancelled]"));
        assert!(message.content.contains("boom"));
    }

    #[tokio::test]
    async fn cancel_agent_reports_unknown_execution_id() {
        let runner = OrchestratorRunner::new(catalog(), Arc::new(ImmediateSuccess), 4);
        let (is_error, _) = runner.cancel_agent("no-such-id").await;
        assert!(is_error);
    }
}
