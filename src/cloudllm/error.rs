//! Component-boundary error enums (§7). Each is a small, `Display`-implementing kind set rather
//! than a stringly-typed error — the same shape the teacher crate uses for `ToolError` and
//! `OrchestrationError`.

use std::fmt;

/// Errors raised while resolving a [`crate::cloudllm::config::ResolvedConfig`] (§4.1, §7
/// "Configuration").
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// The chain passed to `resolve_agent_config`/`resolve_chat_agent_config` was `None`.
    NilChain,
    UnknownAgent(String),
    UnknownProvider(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::NilChain => write!(f, "invalid argument: chain must not be nil"),
            ConfigError::UnknownAgent(name) => write!(f, "not found: unknown agent {:?}", name),
            ConfigError::UnknownProvider(name) => write!(f, "not found: unknown provider {:?}", name),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors surfaced by the LLM streaming client port (§4.3, §7 "LLM-retryable"/"LLM-fatal").
#[derive(Debug, Clone)]
pub enum LlmError {
    /// A classified `Chunk::Error { retryable: true, .. }` — the caller should treat the
    /// iteration as failed-retryable and continue if budget remains.
    Retryable(String),
    /// A classified `Chunk::Error { retryable: false, .. }` or a transport failure before any
    /// chunk was produced — the caller should abort the run with `Failed`.
    Fatal(String),
    /// The per-iteration or session deadline elapsed while awaiting the chunk stream.
    DeadlineExceeded,
    /// The session context was cancelled.
    Cancelled,
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Retryable(msg) => write!(f, "retryable LLM error: {}", msg),
            LlmError::Fatal(msg) => write!(f, "fatal LLM error: {}", msg),
            LlmError::DeadlineExceeded => write!(f, "deadline exceeded"),
            LlmError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for LlmError {}

/// Transport-level tool-executor failures (§4.4). Per-call failures are surfaced inline via
/// `ToolResult.is_error`, not this type — `ToolExecError` is reserved for failures the executor
/// itself cannot turn into a result (e.g. the tool-server process is unreachable).
#[derive(Debug, Clone)]
pub enum ToolExecError {
    ServerUnavailable(String),
    Transport(String),
}

impl fmt::Display for ToolExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolExecError::ServerUnavailable(id) => write!(f, "tool-server unavailable: {}", id),
            ToolExecError::Transport(msg) => write!(f, "tool transport error: {}", msg),
        }
    }
}

impl std::error::Error for ToolExecError {}

/// Infrastructure failures raised before the controller has produced any meaningful result
/// (§4.6, §7 "Infrastructure"). This is the only error type that reaches the outer `Result::Err`
/// of [`crate::cloudllm::facade::AgentFacade::execute`] rather than being classified into an
/// [`crate::cloudllm::types::ExecutionResult`].
#[derive(Debug, Clone)]
pub struct InfrastructureError(pub String);

impl fmt::Display for InfrastructureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "infrastructure error: {}", self.0)
    }
}

impl std::error::Error for InfrastructureError {}

/// The error a controller's `execute` can return, wrapping every non-infrastructure failure kind
/// the facade must classify (§4.6).
#[derive(Debug, Clone)]
pub enum ControllerError {
    Llm(LlmError),
    DeadlineExceeded,
    Cancelled,
    Other(String),
    /// A failure before the controller produced any meaningful result (e.g. the "mark execution
    /// active" persistence call failed). Propagated by the facade as an outer `Err` rather than
    /// classified into an `ExecutionResult` (§4.6, §7 "Infrastructure").
    Infrastructure(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Llm(e) => write!(f, "{}", e),
            ControllerError::DeadlineExceeded => write!(f, "deadline exceeded"),
            ControllerError::Cancelled => write!(f, "cancelled"),
            ControllerError::Other(msg) => write!(f, "{}", msg),
            ControllerError::Infrastructure(msg) => write!(f, "infrastructure error: {}", msg),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<LlmError> for ControllerError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::DeadlineExceeded => ControllerError::DeadlineExceeded,
            LlmError::Cancelled => ControllerError::Cancelled,
            other => ControllerError::Llm(other),
        }
    }
}
