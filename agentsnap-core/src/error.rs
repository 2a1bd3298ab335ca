//! Error types for snapshot operations

use crate::diff::StructuralDiff;

/// Result type for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Error types for the snapshot harness
///
/// Errors are `Clone` so a boundary callback can hand one copy back to the
/// agent while the run session keeps the original for the orchestrator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapshotError {
    /// Replay requested against a case that does not exist
    #[error("Snapshot not found: case '{case}' at {location}")]
    SnapshotNotFound { case: String, location: String },

    /// Live request diverged from the recorded request
    #[error("Request mismatch at loop {loop_index}:\n{diff}")]
    RequestMismatch {
        loop_index: usize,
        diff: StructuralDiff,
    },

    /// Live event stream diverged from the recorded events
    #[error("Event stream mismatch at loop {loop_index}:\n{diff}")]
    EventMismatch {
        loop_index: usize,
        diff: StructuralDiff,
    },

    /// Live tool calls diverged from the recorded tool calls
    #[error("Tool call mismatch at loop {loop_index}:\n{diff}")]
    ToolCallMismatch {
        loop_index: usize,
        diff: StructuralDiff,
    },

    /// Agent executed a different number of loops than the fixture holds
    #[error("Loop count mismatch: fixture has {expected} loops, agent executed {actual}")]
    LoopCountMismatch { expected: usize, actual: usize },

    /// Agent issued a request past the last recorded loop
    #[error("Unexpected loop {loop_index}: fixture only has {expected} recorded loops")]
    UnexpectedLoop { loop_index: usize, expected: usize },

    /// Loop entry exists but lacks a required artifact (partial write)
    #[error("Incomplete loop record {loop_index}: missing {missing}")]
    IncompleteLoop { loop_index: usize, missing: String },

    /// Case layout violates the contiguous loop invariant
    #[error("Corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    /// Run was cancelled by its caller
    #[error("Run cancelled at loop {loop_index}")]
    Cancelled { loop_index: usize },

    /// Error raised by the agent under test
    #[error("Agent error: {0}")]
    Agent(String),

    /// Error raised by an LLM client
    #[error("LLM error: {0}")]
    Llm(String),

    /// Error raised by a tool
    #[error("Tool error: {0}")]
    Tool(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl SnapshotError {
    /// Whether update mode may turn this error into a fixture rewrite
    pub fn is_mismatch(&self) -> bool {
        matches!(
            self,
            SnapshotError::RequestMismatch { .. }
                | SnapshotError::EventMismatch { .. }
                | SnapshotError::ToolCallMismatch { .. }
                | SnapshotError::LoopCountMismatch { .. }
                | SnapshotError::UnexpectedLoop { .. }
        )
    }

    /// Loop index the error refers to, if any
    pub fn loop_index(&self) -> Option<usize> {
        match self {
            SnapshotError::RequestMismatch { loop_index, .. }
            | SnapshotError::EventMismatch { loop_index, .. }
            | SnapshotError::ToolCallMismatch { loop_index, .. }
            | SnapshotError::UnexpectedLoop { loop_index, .. }
            | SnapshotError::IncompleteLoop { loop_index, .. }
            | SnapshotError::Cancelled { loop_index } => Some(*loop_index),
            _ => None,
        }
    }

    /// Structural diff carried by a mismatch, if any
    pub fn diff(&self) -> Option<&StructuralDiff> {
        match self {
            SnapshotError::RequestMismatch { diff, .. }
            | SnapshotError::EventMismatch { diff, .. }
            | SnapshotError::ToolCallMismatch { diff, .. } => Some(diff),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        SnapshotError::Io(err.to_string())
    }
}

impl From<String> for SnapshotError {
    fn from(s: String) -> Self {
        SnapshotError::Other(s)
    }
}

impl From<&str> for SnapshotError {
    fn from(s: &str) -> Self {
        SnapshotError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for SnapshotError {
    fn from(err: anyhow::Error) -> Self {
        SnapshotError::Other(err.to_string())
    }
}
