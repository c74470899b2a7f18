//! Tool executor port and namespaced routing (§4.4).
//!
//! Tool execution is delegated to external tool-servers reachable only by name; this module owns
//! the routing between a namespaced `server.tool` call and the underlying per-server executor,
//! the same responsibility the teacher's `ToolRegistry` gives its routing map, generalized from a
//! protocol-discovery registry to a fixed, construction-time server set.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cloudllm::error::ToolExecError;
use crate::cloudllm::types::{ToolCall, ToolDefinition, ToolResult};

/// A single tool-server's executor port. One implementation per transport (MCP stdio, MCP HTTP,
/// an in-process native tool) — this crate defines the port, not a concrete transport.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute a single tool call, unqualified (no `server.` prefix) within this server.
    async fn execute(&self, tool_name: &str, arguments: &str) -> Result<ToolResult, ToolExecError>;

    /// List this server's tools, unqualified.
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolExecError>;

    /// Release any held connection/session. Default no-op for stateless executors.
    async fn close(&self) -> Result<(), ToolExecError> {
        Ok(())
    }
}

/// Composes several named tool-servers behind one [`ToolExecutor`], routing by the `server.tool`
/// namespacing convention (§3 `ToolCall.name`).
pub struct RoutedToolExecutor {
    servers: HashMap<String, Arc<dyn ToolExecutor>>,
}

impl RoutedToolExecutor {
    pub fn new(servers: HashMap<String, Arc<dyn ToolExecutor>>) -> Self {
        Self { servers }
    }

    /// Split a namespaced tool name into its `(server, tool)` parts.
    ///
    /// Invariant (§3): names with no `.` are rejected rather than guessed at — a malformed name
    /// from the LLM is a tool-call failure, not a routing ambiguity to paper over.
    fn split_name(name: &str) -> Result<(&str, &str), ToolExecError> {
        name.split_once('.').ok_or_else(|| ToolExecError::Transport(format!("tool name {:?} is not namespaced as server.tool", name)))
    }

    fn server_for(&self, server_id: &str) -> Result<&Arc<dyn ToolExecutor>, ToolExecError> {
        self.servers.get(server_id).ok_or_else(|| ToolExecError::ServerUnavailable(server_id.to_string()))
    }

    /// Execute a fully namespaced [`ToolCall`], returning a [`ToolResult`] whose `call_id`/`name`
    /// echo the request so the controller can append a correlated tool-result message.
    pub async fn dispatch(&self, call: &ToolCall) -> Result<ToolResult, ToolExecError> {
        let (server_id, tool_name) = Self::split_name(&call.name)?;
        let executor = self.server_for(server_id)?;
        let mut result = executor.execute(tool_name, &call.arguments).await?;
        result.call_id = call.id.clone();
        result.name = call.name.clone();
        Ok(result)
    }

    /// Aggregate tool definitions across every server, namespacing each name `server.tool` (§4.2
    /// tool-catalog formatter consumes this).
    pub async fn list_all_tools(&self) -> Vec<ToolDefinition> {
        let mut all = Vec::new();
        for (server_id, executor) in &self.servers {
            match executor.list_tools().await {
                Ok(defs) => {
                    for def in defs {
                        all.push(ToolDefinition {
                            name: format!("{}.{}", server_id, def.name),
                            description: def.description,
                            parameters_schema: def.parameters_schema,
                        });
                    }
                }
                Err(_) => continue,
            }
        }
        all
    }

    pub fn server_ids(&self) -> Vec<&str> {
        self.servers.keys().map(|s| s.as_str()).collect()
    }
}

/// A [`RoutedToolExecutor`] is itself a [`ToolExecutor`], so a composed registry can be handed to
/// an [`crate::cloudllm::types::ExecutionContext`] as the single top-level tool executor port —
/// `execute` here expects the namespaced `server.tool` form, unlike a leaf server's `execute`.
#[async_trait]
impl ToolExecutor for RoutedToolExecutor {
    async fn execute(&self, tool_name: &str, arguments: &str) -> Result<ToolResult, ToolExecError> {
        let call = ToolCall { id: String::new(), name: tool_name.to_string(), arguments: arguments.to_string() };
        self.dispatch(&call).await
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolExecError> {
        Ok(self.list_all_tools().await)
    }
}
