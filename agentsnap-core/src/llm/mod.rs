//! LLM client boundary
//!
//! The agent under test talks to its model exclusively through [`LlmClient`].
//! Snapshot runs substitute the client: generate mode keeps the real one and
//! observes it through hooks, replay mode swaps in the replay client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

use crate::error::Result;

pub mod scripted;

pub use scripted::ScriptedLlmClient;

/// Stream of response chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<LlmChunk>> + Send>>;

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,

    /// Tool calls requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Call this tool message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn plain(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(MessageRole::Assistant, content)
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(MessageRole::Tool, content)
        }
    }
}

/// A tool invocation requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Tool definition advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Request to an LLM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<Message>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,

    /// Temperature for generation (0.0-2.0)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,

    /// Free-form request metadata (tracing ids, timestamps)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl LlmRequest {
    /// Create a simple request from a single prompt
    pub fn from_prompt(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![Message::user(prompt)],
            tools: Vec::new(),
            temperature: None,
            max_tokens: None,
            stop_sequences: Vec::new(),
            metadata: Value::Null,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }

    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = Some(tokens);
        self
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Complete response from an LLM
///
/// Every field has a default so a normalized response (with generated
/// fields dropped) still deserializes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmResponse {
    pub id: String,
    pub model: String,
    pub content: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    pub finish_reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
}

impl LlmResponse {
    /// Final text answer
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            finish_reason: Some("stop".to_string()),
            ..Self::default()
        }
    }

    /// Response requesting a single tool call
    pub fn tool_call(name: impl Into<String>, arguments: Value) -> Self {
        Self::tool_calls(vec![ToolCall::new("", name, arguments)])
    }

    /// Response requesting several tool calls
    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            finish_reason: Some("tool_calls".to_string()),
            ..Self::default()
        }
    }

    /// Whether the model produced a final answer rather than tool calls
    pub fn is_final(&self) -> bool {
        self.tool_calls.is_empty()
    }

    /// Assemble a response from streamed chunks
    pub fn from_chunks(chunks: &[LlmChunk]) -> Self {
        let mut content: Option<String> = None;
        let mut tool_calls = Vec::new();
        let mut finish_reason = None;

        for chunk in chunks {
            if let Some(piece) = &chunk.content {
                content.get_or_insert_with(String::new).push_str(piece);
            }
            tool_calls.extend(chunk.tool_calls.iter().cloned());
            if chunk.finish_reason.is_some() {
                finish_reason = chunk.finish_reason.clone();
            }
        }

        Self {
            content,
            tool_calls,
            finish_reason,
            ..Self::default()
        }
    }
}

/// One element of a streamed response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmChunk {
    pub content: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    pub finish_reason: Option<String>,
}

impl LlmChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    /// A whole response as a single chunk
    pub fn from_response(response: &LlmResponse) -> Self {
        Self {
            content: response.content.clone(),
            tool_calls: response.tool_calls.clone(),
            finish_reason: response.finish_reason.clone(),
        }
    }
}

/// Model information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider: String,
    pub model_name: String,
}

/// Trait for LLM client implementations.
///
/// Implementors handle the actual model calls. The replay client and the
/// scripted client in this crate are implementations too.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Complete a request in one call
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Stream a response.
    ///
    /// The default implementation completes the request and yields the whole
    /// response as a single chunk.
    async fn stream(&self, request: &LlmRequest) -> Result<ChunkStream> {
        let response = self.complete(request).await?;
        let chunk = LlmChunk::from_response(&response);
        Ok(Box::pin(futures::stream::iter(vec![Ok(chunk)])))
    }

    /// Get model information
    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "unknown".to_string(),
            model_name: "unknown".to_string(),
        }
    }
}
