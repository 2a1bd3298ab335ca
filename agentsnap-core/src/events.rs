//! Agent event protocol
//!
//! Agents emit structured events at task, turn, chunk and tool boundaries.
//! Each event is wrapped in an [`EventEnvelope`] that carries a run-wide
//! sequence number, the loop index it belongs to and a timestamp. Snapshot
//! fixtures store envelopes per loop; replay compares them position by
//! position after normalization.
//!
//! # Event Types
//!
//! - [`AgentEvent::TaskStarted`] - a run begins
//! - [`AgentEvent::TurnStarted`] - a loop iteration begins
//! - [`AgentEvent::StreamChunk`] - one streamed response chunk
//! - [`AgentEvent::ToolCallStarted`] / [`AgentEvent::ToolCallCompleted`] - tool boundaries
//! - [`AgentEvent::TurnCompleted`] - a loop iteration ends
//! - [`AgentEvent::TaskCompleted`] - the run ends, carrying the final response

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::Result;

/// Events emitted during agent execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Emitted when a task begins execution
    TaskStarted {
        /// Unique identifier for this task execution
        task_id: String,
        agent_name: String,
        prompt: String,
    },

    /// Emitted when a task completes (successfully or not)
    TaskCompleted {
        task_id: String,
        agent_name: String,
        /// False when the loop cap was reached without a final answer
        success: bool,
        response: Option<String>,
        turns: usize,
        tool_calls: usize,
        duration_ms: u64,
    },

    /// Emitted at the start of each loop iteration
    TurnStarted {
        task_id: String,
        turn_index: usize,
    },

    /// Emitted when a loop iteration completes
    TurnCompleted {
        task_id: String,
        turn_index: usize,
        had_tool_calls: bool,
        is_final: bool,
    },

    /// Emitted before a tool is executed
    ToolCallStarted {
        task_id: String,
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
    },

    /// Emitted after a tool completes execution
    ToolCallCompleted {
        task_id: String,
        tool_call_id: String,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
    },

    /// Emitted for each streamed LLM response chunk
    StreamChunk {
        task_id: String,
        chunk: String,
    },

    /// Custom event for extension
    Custom {
        task_id: Option<String>,
        name: String,
        data: Value,
    },
}

impl AgentEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            AgentEvent::TaskStarted { .. } => "task_started",
            AgentEvent::TaskCompleted { .. } => "task_completed",
            AgentEvent::TurnStarted { .. } => "turn_started",
            AgentEvent::TurnCompleted { .. } => "turn_completed",
            AgentEvent::ToolCallStarted { .. } => "tool_call_started",
            AgentEvent::ToolCallCompleted { .. } => "tool_call_completed",
            AgentEvent::StreamChunk { .. } => "stream_chunk",
            AgentEvent::Custom { .. } => "custom",
        }
    }

    /// Get the task_id if present
    pub fn task_id(&self) -> Option<&str> {
        match self {
            AgentEvent::TaskStarted { task_id, .. }
            | AgentEvent::TaskCompleted { task_id, .. }
            | AgentEvent::TurnStarted { task_id, .. }
            | AgentEvent::TurnCompleted { task_id, .. }
            | AgentEvent::ToolCallStarted { task_id, .. }
            | AgentEvent::ToolCallCompleted { task_id, .. }
            | AgentEvent::StreamChunk { task_id, .. } => Some(task_id),
            AgentEvent::Custom { task_id, .. } => task_id.as_deref(),
        }
    }

    /// Whether this event ends a run
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::TaskCompleted { .. })
    }

    /// Final response carried by a `TaskCompleted` event
    pub fn final_response(&self) -> Option<&str> {
        match self {
            AgentEvent::TaskCompleted { response, .. } => response.as_deref(),
            _ => None,
        }
    }
}

/// An event with its position in the run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Run-wide sequence number, starting at 0
    pub sequence: usize,
    /// Loop iteration the event belongs to
    pub loop_index: usize,
    pub timestamp: DateTime<Utc>,
    pub event: AgentEvent,
}

impl EventEnvelope {
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Serialize envelopes and group them by loop index
pub fn group_by_loop(events: &[EventEnvelope]) -> Result<BTreeMap<usize, Vec<Value>>> {
    let mut grouped: BTreeMap<usize, Vec<Value>> = BTreeMap::new();
    for envelope in events {
        grouped
            .entry(envelope.loop_index)
            .or_default()
            .push(envelope.to_value()?);
    }
    Ok(grouped)
}

/// Append-only log of the events of the current run
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<EventEnvelope>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event and return its envelope
    pub fn emit(&self, loop_index: usize, event: AgentEvent) -> EventEnvelope {
        let mut events = self.lock();
        let envelope = EventEnvelope {
            sequence: events.len(),
            loop_index,
            timestamp: Utc::now(),
            event,
        };
        tracing::trace!(
            sequence = envelope.sequence,
            loop_index = loop_index,
            event_type = envelope.event.event_type(),
            "Event emitted"
        );
        events.push(envelope.clone());
        envelope
    }

    /// All events emitted so far
    pub fn snapshot(&self) -> Vec<EventEnvelope> {
        self.lock().clone()
    }

    /// Events with a sequence number of at least `sequence`
    pub fn since(&self, sequence: usize) -> Vec<EventEnvelope> {
        self.lock().iter().skip(sequence).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<EventEnvelope>> {
        // A poisoned log still holds valid envelopes
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}
