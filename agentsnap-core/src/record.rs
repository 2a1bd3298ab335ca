//! Persisted snapshot records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::RunMode;
use crate::error::{Result, SnapshotError};
use crate::llm::{LlmChunk, LlmResponse};

/// Current schema version for case manifests
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Normalized LLM response of one loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RecordedResponse {
    /// Response of a blocking call
    Message(Value),
    /// Chunks of a streamed call, in delivery order
    Chunks(Vec<Value>),
}

impl RecordedResponse {
    /// Assemble the recorded response as one message
    pub fn to_response(&self) -> Result<LlmResponse> {
        match self {
            RecordedResponse::Message(value) => Ok(serde_json::from_value(value.clone())?),
            RecordedResponse::Chunks(_) => Ok(LlmResponse::from_chunks(&self.to_chunks()?)),
        }
    }

    /// The recorded response as a chunk sequence
    pub fn to_chunks(&self) -> Result<Vec<LlmChunk>> {
        match self {
            RecordedResponse::Message(value) => {
                let response: LlmResponse = serde_json::from_value(value.clone())?;
                Ok(vec![LlmChunk::from_response(&response)])
            }
            RecordedResponse::Chunks(values) => values
                .iter()
                .map(|v| serde_json::from_value(v.clone()).map_err(SnapshotError::from))
                .collect(),
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, RecordedResponse::Chunks(_))
    }
}

/// One loop iteration of a snapshot case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopRecord {
    pub loop_index: usize,

    /// Normalized LLM request
    pub request: Value,

    /// Normalized LLM response
    pub response: RecordedResponse,

    /// Normalized events emitted during the iteration
    #[serde(default)]
    pub events: Vec<Value>,

    /// Normalized tool calls made during the iteration
    #[serde(default)]
    pub tool_calls: Vec<Value>,
}

impl LoopRecord {
    pub fn new(loop_index: usize, request: Value, response: RecordedResponse) -> Self {
        Self {
            loop_index,
            request,
            response,
            events: Vec::new(),
            tool_calls: Vec::new(),
        }
    }
}

/// Informational summary stored at the root of a case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseManifest {
    pub schema_version: u32,
    pub case_name: String,
    pub recorded_at: DateTime<Utc>,
    pub loop_count: usize,
    pub mode: RunMode,
    /// Version of the crate that wrote the case
    pub version: String,
}

impl CaseManifest {
    pub fn new(case_name: impl Into<String>, loop_count: usize, mode: RunMode) -> Self {
        Self {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            case_name: case_name.into(),
            recorded_at: Utc::now(),
            loop_count,
            mode,
            version: crate::VERSION.to_string(),
        }
    }
}
