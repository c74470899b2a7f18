// src/lib.rs

// Import the top-level `cloudllm` module.
pub mod cloudllm;

// Re-exporting key items for easier external access.
pub use cloudllm::client_wrapper::{HttpLlmClient, LlmClient, SharedLlmClient};
pub use cloudllm::config::{AgentType, ConfigResolver, ResolvedConfig};
pub use cloudllm::controller::{Controller, ControllerVariant, IterationController};
pub use cloudllm::error::{ConfigError, ControllerError, InfrastructureError, LlmError, ToolExecError};
pub use cloudllm::event::{EventPublisher, NullEventPublisher, TimelineEvent};
pub use cloudllm::facade::{AgentFacade, ControllerFactory};
pub use cloudllm::orchestrator::{ChildExecutor, OrchestratorRunner};
pub use cloudllm::tool_protocol::{RoutedToolExecutor, ToolExecutor};
pub use cloudllm::types::{ConversationMessage, ExecutionContext, ExecutionResult, ExecutionStatus, Role};
