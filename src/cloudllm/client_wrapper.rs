//! Provider-agnostic streaming LLM client port (§4.3).
//!
//! Mirrors the teacher's `ClientWrapper` trait shape (a `Send + Sync` trait object wrapping a
//! concrete vendor SDK) but narrows the surface to the one operation the controller actually
//! needs: a lazy, cancellable chunk stream. Request/response chat completion and native-tool
//! wire mapping are provider concerns left to whoever implements [`LlmClient`] for a given
//! backend — this crate supplies the port plus one reference HTTP implementation.

use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use lazy_static::lazy_static;

use crate::cloudllm::error::LlmError;
use crate::cloudllm::types::{Chunk, ConversationMessage, ToolDefinition};

lazy_static! {
    /// Process-wide HTTP client, reused across every [`HttpLlmClient`] instance so connection
    /// pooling is shared rather than rebuilt per request (teacher's `SHARED_HTTP_CLIENT`).
    static ref SHARED_HTTP_CLIENT: reqwest::Client = reqwest::Client::new();
}

/// A stream of [`Chunk`]s produced by one LLM turn. Bounded by [`crate::cloudllm::types::LLM_CHUNK_CHANNEL_BUFFER`]
/// when an implementation is backed by a `tokio::sync::mpsc` channel (§6 Limits).
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, LlmError>> + Send>>;

/// Streaming LLM client port. One implementation per provider; the controller only ever talks to
/// this trait object (§4.3).
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Begin a turn over the given transcript, with the given tool catalog available for native
    /// function calling. Returns a lazily-consumed stream — no chunk is produced until the
    /// controller polls it, so a cancelled execution never pays for tokens it discards.
    async fn generate(&self, messages: &[ConversationMessage], tools: &[ToolDefinition]) -> Result<ChunkStream, LlmError>;

    /// Release any held connection/session. Default no-op — most HTTP-backed clients have
    /// nothing to release.
    async fn close(&self) -> Result<(), LlmError> {
        Ok(())
    }
}

/// Reference [`LlmClient`] implementation speaking an OpenAI-compatible streaming chat-completion
/// endpoint. Concrete vendor wire formats beyond this shape are a declared non-goal (§1); this
/// type exists to exercise the port end-to-end, not to cover every provider.
pub struct HttpLlmClient {
    base_url: String,
    api_key: String,
    model_id: String,
}

impl HttpLlmClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), api_key: api_key.into(), model_id: model_id.into() }
    }

    fn request_body(&self, messages: &[ConversationMessage], tools: &[ToolDefinition]) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    crate::cloudllm::types::Role::System => "system",
                    crate::cloudllm::types::Role::User => "user",
                    crate::cloudllm::types::Role::Assistant => "assistant",
                    crate::cloudllm::types::Role::Tool => "tool",
                };
                let mut obj = serde_json::json!({ "role": role, "content": m.content.as_ref() });
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = serde_json::Value::String(id.clone());
                }
                obj
            })
            .collect();

        let tools: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": serde_json::from_str::<serde_json::Value>(&t.parameters_schema).unwrap_or(serde_json::json!({})),
                    }
                })
            })
            .collect();

        let mut body = serde_json::json!({ "model": self.model_id, "messages": messages, "stream": true });
        if !tools.is_empty() {
            body["tools"] = serde_json::Value::Array(tools);
        }
        body
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(&self, messages: &[ConversationMessage], tools: &[ToolDefinition]) -> Result<ChunkStream, LlmError> {
        let body = self.request_body(messages, tools);

        let response = SHARED_HTTP_CLIENT
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if log::log_enabled!(log::Level::Error) {
                    log::error!("HttpLlmClient::generate({}): request failed: {}", self.model_id, e);
                }
                LlmError::Fatal(e.to_string())
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if log::log_enabled!(log::Level::Error) {
                log::error!("HttpLlmClient::generate({}): http {}: {}", self.model_id, status, text);
            }
            return Err(LlmError::Fatal(format!("http {}: {}", status, text)));
        }
        if log::log_enabled!(log::Level::Debug) {
            log::debug!("HttpLlmClient::generate({}): streaming response opened", self.model_id);
        }

        let byte_stream = response.bytes_stream();
        let chunk_stream = byte_stream.map(|result| -> Result<Chunk, LlmError> {
            let bytes = result.map_err(|e| LlmError::Retryable(e.to_string()))?;
            parse_sse_line(&bytes)
        });

        Ok(Box::pin(chunk_stream))
    }
}

/// Parse one line of an OpenAI-compatible server-sent-events stream into a [`Chunk`].
///
/// Unrecognized or keep-alive lines map to an empty `Chunk::Text`, matching the teacher's
/// `chunks_to_stream` tolerance for blank SSE frames.
fn parse_sse_line(bytes: &[u8]) -> Result<Chunk, LlmError> {
    let text = std::str::from_utf8(bytes).map_err(|e| LlmError::Fatal(e.to_string()))?;
    let payload = text.trim().trim_start_matches("data:").trim();
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(Chunk::Text { content: String::new() });
    }

    let value: serde_json::Value = serde_json::from_str(payload).map_err(|e| LlmError::Retryable(e.to_string()))?;
    let delta = &value["choices"][0]["delta"];

    if let Some(content) = delta["content"].as_str() {
        return Ok(Chunk::Text { content: content.to_string() });
    }
    if let Some(calls) = delta["tool_calls"].as_array() {
        if let Some(call) = calls.first() {
            return Ok(Chunk::ToolCall {
                call_id: call["id"].as_str().unwrap_or_default().to_string(),
                name: call["function"]["name"].as_str().unwrap_or_default().to_string(),
                arguments: call["function"]["arguments"].as_str().unwrap_or_default().to_string(),
            });
        }
    }
    if let Some(usage) = value.get("usage") {
        return Ok(Chunk::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: usage["total_tokens"].as_u64().unwrap_or(0),
            thinking_tokens: 0,
        });
    }

    Ok(Chunk::Text { content: String::new() })
}

/// Convenience port type alias used throughout `controller.rs`/`facade.rs`.
pub type SharedLlmClient = Arc<dyn LlmClient>;
