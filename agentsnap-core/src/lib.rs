//! # agentsnap - Deterministic snapshots for LLM agent loops
//!
//! agentsnap records the LLM traffic, events and tool calls of an agent run
//! into a snapshot case, then replays the case against the same agent with
//! the LLM replaced by a mock serving the recorded responses:
//! - Record one loop record per LLM call (`generate`)
//! - Replay recorded responses in loop order, blocking or streaming
//! - Normalize away volatile fields (ids, timestamps) before comparing
//! - Report the first divergence with a structural diff
//! - Rewrite a case from the live run in update mode
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agentsnap_core::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Arc::new(ScriptedLlmClient::new(vec![LlmResponse::text("Hello!")]));
//!     let agent = Arc::new(LoopAgent::builder().name("greeter").llm_client(client).build()?);
//!
//!     let snapshot = AgentSnapshot::new(agent, SnapshotConfig::new("tests/snapshots", "greeting"))?;
//!     snapshot.generate("Say hello").await?;
//!
//!     let replayed = snapshot.replay("Say hello", None).await?;
//!     assert_eq!(replayed.response, "Hello!");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Agent boundary**: agents implement [`SnapshotAgent`](agent::SnapshotAgent);
//!   the harness swaps their LLM client and installs [`LoopHooks`](agent::LoopHooks)
//! - **Store**: loop records under `<snapshot_dir>/<case>/loop-<N>/`
//! - **Normalizer**: path rules and value patterns per payload kind
//! - **Replay**: mock client, loop pointer and post-run verification

pub mod agent;
pub mod config;
pub mod diff;
pub mod error;
pub mod events;
pub mod hooks;
pub mod llm;
pub mod normalize;
pub mod record;
pub mod replay;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod verify;

pub use error::{Result, SnapshotError};
pub use snapshot::{AgentSnapshot, ReplayOverrides, RunOptions, SnapshotMeta, SnapshotResult};

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::agent::{
        AgentInput, AgentTool, FnTool, LoopAgent, LoopAgentBuilder, LoopHooks, RunMode,
        SnapshotAgent, ToolCallRecord,
    };
    pub use crate::config::SnapshotConfig;
    pub use crate::diff::{FieldDiff, StructuralDiff};
    pub use crate::error::{Result, SnapshotError};
    pub use crate::events::{AgentEvent, EventEnvelope};
    pub use crate::llm::{
        LlmChunk, LlmClient, LlmRequest, LlmResponse, Message, ScriptedLlmClient, ToolCall,
        ToolSpec,
    };
    pub use crate::normalize::{FieldRule, NormalizeAction, Normalizer, NormalizerConfig, PayloadKind};
    pub use crate::record::{LoopRecord, RecordedResponse};
    pub use crate::snapshot::{
        AgentSnapshot, ReplayOverrides, RunOptions, SnapshotMeta, SnapshotResult,
    };
    pub use crate::store::{FsSnapshotStore, InMemorySnapshotStore, SnapshotStore};
    pub use crate::verify::{VerificationConfig, VerificationOverrides};
}
