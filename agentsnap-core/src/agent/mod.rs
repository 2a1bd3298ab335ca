//! Agent boundary
//!
//! The snapshot harness never reaches into an agent's private state. It
//! interacts with the agent under test through [`SnapshotAgent`]: it swaps
//! the LLM client, installs [`LoopHooks`] observing every LLM and tool
//! boundary, runs the agent and reads back the events it emitted.
//!
//! [`LoopAgent`] is a reference tool-calling loop implementing the trait.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::{AgentEvent, EventEnvelope};
use crate::llm::{LlmChunk, LlmClient, LlmRequest, LlmResponse};

mod loop_agent;
mod tool;

pub use loop_agent::{LoopAgent, LoopAgentBuilder};
pub use tool::{AgentTool, FnTool};

/// Stream of events produced by a streaming run
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventEnvelope>> + Send>>;

/// Result returned by boundary callbacks; an error aborts the agent's run
pub type HookResult = Result<()>;

/// How the agent is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Run to completion and return the final event
    #[default]
    Blocking,
    /// Consume the agent's event stream element by element
    Streaming,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Blocking => write!(f, "blocking"),
            RunMode::Streaming => write!(f, "streaming"),
        }
    }
}

/// Input handed to the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentInput {
    pub prompt: String,

    /// Structured context accompanying the prompt
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub context: Value,
}

impl AgentInput {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}

impl From<&str> for AgentInput {
    fn from(prompt: &str) -> Self {
        Self::new(prompt)
    }
}

impl From<String> for AgentInput {
    fn from(prompt: String) -> Self {
        Self::new(prompt)
    }
}

/// A tool invocation as observed at the agent boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub result: Value,
    pub success: bool,
    pub duration_ms: u64,
}

/// Callbacks invoked by the agent at its loop boundaries.
///
/// `loop_index` is the 0-based iteration the boundary belongs to. Returning
/// an error aborts the agent's run with that error.
#[async_trait]
pub trait LoopHooks: Send + Sync {
    /// Called before the LLM request of a loop is sent
    async fn before_llm_request(&self, loop_index: usize, request: &LlmRequest) -> HookResult;

    /// Called after a blocking LLM call returned
    async fn after_llm_response(&self, loop_index: usize, response: &LlmResponse) -> HookResult;

    /// Called after a streamed LLM response was fully consumed
    async fn after_llm_stream(&self, loop_index: usize, chunks: &[LlmChunk]) -> HookResult;

    /// Called after a tool finished executing
    async fn after_tool_call(&self, _loop_index: usize, _call: &ToolCallRecord) -> HookResult {
        Ok(())
    }
}

/// Contract an agent implements to be snapshot-tested.
///
/// Methods take `&self`; implementations use interior mutability so the
/// orchestrator can hold the agent in an `Arc` shared with the caller.
#[async_trait]
pub trait SnapshotAgent: Send + Sync {
    /// The LLM client currently installed
    fn llm_client(&self) -> Arc<dyn LlmClient>;

    /// Replace the LLM client
    fn set_llm_client(&self, client: Arc<dyn LlmClient>);

    /// Install or remove boundary hooks
    fn set_hooks(&self, hooks: Option<Arc<dyn LoopHooks>>);

    /// Run to completion, returning the final `TaskCompleted` event
    async fn run(&self, input: AgentInput, cancel: CancellationToken) -> Result<AgentEvent>;

    /// Run as a stream of events ending with `TaskCompleted`
    async fn run_stream(&self, input: AgentInput, cancel: CancellationToken)
    -> Result<EventStream>;

    /// Events emitted by the most recent run, in order
    fn events(&self) -> Vec<EventEnvelope>;

    /// Loop iterations started by the most recent run
    fn executed_loops(&self) -> usize;
}
