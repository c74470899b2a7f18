//! Timeline event publisher port (§6 "Event publisher ports").
//!
//! The controller narrates each iteration through an [`EventPublisher`] without knowing who, if
//! anyone, is listening — the same default-no-op trait-method idiom the teacher crate uses for
//! its `EventHandler`, generalized from two callback methods keyed by event enum to one method
//! per timeline moment so a publisher implementation only has to match on the events it cares
//! about.

use async_trait::async_trait;

use crate::cloudllm::types::{Chunk, TokenUsage, ToolResult};

/// One moment in an execution's timeline, as published by the iteration controller (§4.5).
#[derive(Debug, Clone)]
pub enum TimelineEvent {
    IterationStarted { execution_id: String, iteration: u32 },
    ChunkReceived { execution_id: String, iteration: u32, chunk: Chunk },
    ToolCallDispatched { execution_id: String, iteration: u32, tool_name: String, call_id: String },
    ToolResultReceived { execution_id: String, iteration: u32, result: ToolResult },
    /// Follows a `ToolResultReceived` when the raw result exceeded the server's token budget and
    /// was replaced with an LLM-produced summary (§4.5 step 6).
    McpToolSummary { execution_id: String, iteration: u32, server: String, tool: String, original_tokens: u32, summary_tokens: u32 },
    IterationFailed { execution_id: String, iteration: u32, message: String, is_timeout: bool },
    ForcedConclusion { execution_id: String, iteration: u32 },
    ExecutionCompleted { execution_id: String, token_usage: TokenUsage },
}

/// Receives [`TimelineEvent`]s as an execution progresses. Every method defaults to a no-op so a
/// publisher only needs to override what it actually records.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: TimelineEvent) {
        let _ = event;
    }
}

/// No-op publisher, used when a caller has nothing to observe.
pub struct NullEventPublisher;

#[async_trait]
impl EventPublisher for NullEventPublisher {}

/// Test double that records every published event in arrival order, guarded by a
/// `tokio::sync::Mutex` so it can be shared as `Arc<dyn EventPublisher>` across concurrent
/// controllers (used by the orchestrator fan-out tests, §4.7).
pub struct RecordingEventPublisher {
    events: tokio::sync::Mutex<Vec<TimelineEvent>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self { events: tokio::sync::Mutex::new(Vec::new()) }
    }

    pub async fn events(&self) -> Vec<TimelineEvent> {
        self.events.lock().await.clone()
    }
}

impl Default for RecordingEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(&self, event: TimelineEvent) {
        self.events.lock().await.push(event);
    }
}
