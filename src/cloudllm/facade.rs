//! Result classification and controller selection (§4.6).
//!
//! Mirrors the teacher's `Agent` as a thin public facade over internal state: callers never touch
//! an `IterationController` directly, only an [`AgentFacade`] plus whatever [`ControllerFactory`]
//! built for the resolved config.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cloudllm::config::AgentType;
use crate::cloudllm::controller::{Controller, ControllerVariant, IterationController};
use crate::cloudllm::error::{ControllerError, InfrastructureError};
use crate::cloudllm::orchestrator::{ChildExecutor, OrchestratorRunner};
use crate::cloudllm::prompt_builder;
use crate::cloudllm::types::{ConversationMessage, ExecutionContext, ExecutionResult, TokenUsage};

/// Seed conversation for a standard investigation execution (§4.2, §4.5).
pub struct InvestigationVariant;

#[async_trait]
impl ControllerVariant for InvestigationVariant {
    async fn build_initial_messages(&self, ctx: &ExecutionContext, _tool_catalog_block: &str) -> Vec<ConversationMessage> {
        vec![
            ConversationMessage::system(prompt_builder::investigation_system_prompt(ctx, &[])),
            ConversationMessage::user(prompt_builder::investigation_user_prompt(ctx)),
        ]
    }
}

/// Synthesis: single-turn, no tools, combines `parallel_results` text carried over `chain_context`
/// (§4.5 "Synthesis agent").
pub struct SynthesisVariant {
    pub parallel_results: String,
}

#[async_trait]
impl ControllerVariant for SynthesisVariant {
    async fn build_initial_messages(&self, ctx: &ExecutionContext, _tool_catalog_block: &str) -> Vec<ConversationMessage> {
        vec![
            ConversationMessage::system(prompt_builder::synthesis_system_prompt(ctx, &ctx.config.provider.native_tools)),
            ConversationMessage::user(prompt_builder::synthesis_user_prompt(ctx, &self.parallel_results)),
        ]
    }

    fn tools_enabled(&self) -> bool {
        false
    }
}

/// Scoring: single-turn, no tools, skips "mark active" (§4.5 "Scoring agent").
pub struct ScoringVariant;

#[async_trait]
impl ControllerVariant for ScoringVariant {
    async fn build_initial_messages(&self, ctx: &ExecutionContext, _tool_catalog_block: &str) -> Vec<ConversationMessage> {
        let mut system = String::from("You are a scoring agent. Evaluate the investigation output and respond with \
structured output matching the configured scoring schema.");
        if !ctx.config.custom_instructions.is_empty() {
            system.push_str("\n\n## Agent-Specific Instructions\n\n");
            system.push_str(&ctx.config.custom_instructions);
        }
        vec![ConversationMessage::system(system), ConversationMessage::user(ctx.chain_context.clone())]
    }

    fn tools_enabled(&self) -> bool {
        false
    }

    fn mark_active(&self) -> bool {
        false
    }
}

/// Chat: uses the chat prompt variant, tools optional per the resolved config (§4.5 "Chat agent").
pub struct ChatVariant;

#[async_trait]
impl ControllerVariant for ChatVariant {
    async fn build_initial_messages(&self, ctx: &ExecutionContext, _tool_catalog_block: &str) -> Vec<ConversationMessage> {
        let chat_ctx = ctx.chat_context.as_ref().expect("chat execution requires chat_context to be set");
        vec![ConversationMessage::system(prompt_builder::chat_system_prompt(ctx)), ConversationMessage::user(prompt_builder::chat_user_prompt(chat_ctx))]
    }
}

/// Sub-agent: task-only user message, otherwise identical to investigation (§4.5 "Sub-agent").
pub struct SubAgentVariant;

#[async_trait]
impl ControllerVariant for SubAgentVariant {
    async fn build_initial_messages(&self, ctx: &ExecutionContext, _tool_catalog_block: &str) -> Vec<ConversationMessage> {
        let task = ctx.sub_agent_context.as_ref().map(|s| s.task.as_str()).unwrap_or("");
        vec![
            ConversationMessage::system(prompt_builder::investigation_system_prompt(ctx, &[])),
            ConversationMessage::user(prompt_builder::sub_agent_user_prompt(task)),
        ]
    }
}

/// Orchestrator: exposes `dispatch_agent`/`cancel_agent` as native tools and auto-pauses on
/// pending sub-agent results (§4.7).
pub struct OrchestratorVariant {
    pub runner: Arc<OrchestratorRunner>,
}

#[async_trait]
impl ControllerVariant for OrchestratorVariant {
    async fn build_initial_messages(&self, ctx: &ExecutionContext, _tool_catalog_block: &str) -> Vec<ConversationMessage> {
        let catalog = ctx.sub_agent_catalog.clone().unwrap_or_default();
        vec![
            ConversationMessage::system(prompt_builder::orchestrator_system_prompt(ctx, &catalog, &[])),
            ConversationMessage::user(prompt_builder::investigation_user_prompt(ctx)),
        ]
    }

    fn orchestrator_runner(&self) -> Option<&OrchestratorRunner> {
        Some(&self.runner)
    }
}

/// A controller built for one of the six agent variants, erased behind one concrete type so the
/// factory can return a value rather than a boxed trait object per call site.
pub enum AnyController {
    Investigation(IterationController<InvestigationVariant>),
    Synthesis(IterationController<SynthesisVariant>),
    Scoring(IterationController<ScoringVariant>),
    Chat(IterationController<ChatVariant>),
    SubAgent(IterationController<SubAgentVariant>),
    Orchestrator(IterationController<OrchestratorVariant>),
}

#[async_trait]
impl Controller for AnyController {
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Option<ExecutionResult>, ControllerError> {
        match self {
            AnyController::Investigation(c) => c.execute(ctx).await,
            AnyController::Synthesis(c) => c.execute(ctx).await,
            AnyController::Scoring(c) => c.execute(ctx).await,
            AnyController::Chat(c) => c.execute(ctx).await,
            AnyController::SubAgent(c) => c.execute(ctx).await,
            AnyController::Orchestrator(c) => c.execute(ctx).await,
        }
    }
}

/// Wraps a controller and classifies its result into an [`ExecutionResult`], per §4.6. The outer
/// `Err` is reserved for infrastructure failures the controller could not absorb into a result.
pub struct AgentFacade<C: Controller> {
    controller: C,
}

impl<C: Controller> AgentFacade<C> {
    pub fn new(controller: C) -> Self {
        Self { controller }
    }

    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult, InfrastructureError> {
        match self.controller.execute(ctx).await {
            Ok(Some(result)) => Ok(result),
            Ok(None) => Ok(ExecutionResult::failed("controller returned no result", String::new(), TokenUsage::default())),
            Err(ControllerError::DeadlineExceeded) => Ok(ExecutionResult::timed_out("deadline exceeded", String::new(), TokenUsage::default())),
            Err(ControllerError::Cancelled) => Ok(ExecutionResult::cancelled("cancelled", TokenUsage::default())),
            Err(ControllerError::Infrastructure(msg)) => Err(InfrastructureError(msg)),
            Err(other) => Ok(ExecutionResult::failed(other.to_string(), String::new(), TokenUsage::default())),
        }
    }
}

/// Runs a child execution by recursively asking [`ControllerFactory`] to build whatever controller
/// its `agent_type` calls for, then classifying the result through the same facade every top-level
/// execution uses (§4.7 "spawns a background worker... creates its controller via the factory").
pub struct FactoryChildExecutor;

#[async_trait]
impl ChildExecutor for FactoryChildExecutor {
    async fn run_child(&self, ctx: ExecutionContext) -> Result<Option<ExecutionResult>, ControllerError> {
        let controller = ControllerFactory::build(&ctx);
        let facade = AgentFacade::new(controller);
        match facade.execute(&ctx).await {
            Ok(result) => Ok(Some(result)),
            Err(InfrastructureError(msg)) => Err(ControllerError::Infrastructure(msg)),
        }
    }
}

/// Selects a controller variant from a resolved [`ExecutionContext`] (§4.6 "The factory
/// selects...").
pub struct ControllerFactory;

impl ControllerFactory {
    pub fn build(ctx: &ExecutionContext) -> AnyController {
        match ctx.config.agent_type {
            AgentType::Synthesis => AnyController::Synthesis(IterationController::new(SynthesisVariant { parallel_results: ctx.chain_context.clone() })),
            AgentType::Scoring => AnyController::Scoring(IterationController::new(ScoringVariant)),
            AgentType::Orchestrator => {
                let catalog = ctx.sub_agent_catalog.clone().unwrap_or_default();
                let buffer = catalog.len().max(1);
                let runner = Arc::new(OrchestratorRunner::new(catalog, Arc::new(FactoryChildExecutor), buffer));
                AnyController::Orchestrator(IterationController::new(OrchestratorVariant { runner }))
            }
            AgentType::Default => {
                if ctx.chat_context.is_some() {
                    AnyController::Chat(IterationController::new(ChatVariant))
                } else if ctx.sub_agent_context.is_some() {
                    AnyController::SubAgent(IterationController::new(SubAgentVariant))
                } else {
                    AnyController::Investigation(IterationController::new(InvestigationVariant))
                }
            }
        }
    }
}
