//! Post-replay verification of events and tool calls
//!
//! Requests are verified by the replay client as they arrive. Events and tool
//! calls are only complete once the agent returns, so they are checked here
//! against the stored records, loop by loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::diff::StructuralDiff;
use crate::error::{Result, SnapshotError};
use crate::normalize::{Normalizer, PayloadKind};
use crate::record::LoopRecord;
use crate::session::LiveLoop;

/// Which artifacts replay compares against the fixture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Compare each live LLM request with the recorded one
    pub verify_llm_requests: bool,

    /// Compare the live event stream with the recorded events
    pub verify_event_streams: bool,

    /// Compare live tool calls with the recorded ones
    pub verify_tool_calls: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            verify_llm_requests: true,
            verify_event_streams: true,
            verify_tool_calls: true,
        }
    }
}

impl VerificationConfig {
    /// Verify nothing; replay only checks loop counts
    pub fn none() -> Self {
        Self {
            verify_llm_requests: false,
            verify_event_streams: false,
            verify_tool_calls: false,
        }
    }

    /// Apply per-call overrides on top of this configuration
    pub fn merged(&self, overrides: &VerificationOverrides) -> Self {
        Self {
            verify_llm_requests: overrides
                .verify_llm_requests
                .unwrap_or(self.verify_llm_requests),
            verify_event_streams: overrides
                .verify_event_streams
                .unwrap_or(self.verify_event_streams),
            verify_tool_calls: overrides
                .verify_tool_calls
                .unwrap_or(self.verify_tool_calls),
        }
    }
}

/// Per-call verification overrides; `None` keeps the instance setting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOverrides {
    pub verify_llm_requests: Option<bool>,
    pub verify_event_streams: Option<bool>,
    pub verify_tool_calls: Option<bool>,
}

impl VerificationOverrides {
    pub fn with_llm_requests(mut self, verify: bool) -> Self {
        self.verify_llm_requests = Some(verify);
        self
    }

    pub fn with_event_streams(mut self, verify: bool) -> Self {
        self.verify_event_streams = Some(verify);
        self
    }

    pub fn with_tool_calls(mut self, verify: bool) -> Self {
        self.verify_tool_calls = Some(verify);
        self
    }
}

/// Compares live artifacts with stored records
pub struct Verifier<'a> {
    config: VerificationConfig,
    normalizer: &'a Normalizer,
}

impl<'a> Verifier<'a> {
    pub fn new(config: VerificationConfig, normalizer: &'a Normalizer) -> Self {
        Self { config, normalizer }
    }

    /// Compare the events of one loop position-for-position
    pub fn verify_events(&self, loop_index: usize, stored: &[Value], live: &[Value]) -> Result<()> {
        let diff = self.diff_normalized(PayloadKind::Event, stored, live);
        if diff.is_empty() {
            return Ok(());
        }
        Err(SnapshotError::EventMismatch { loop_index, diff })
    }

    /// Compare the tool calls of one loop by position
    pub fn verify_tool_calls(
        &self,
        loop_index: usize,
        stored: &[Value],
        live: &[Value],
    ) -> Result<()> {
        let diff = self.diff_normalized(PayloadKind::ToolCall, stored, live);
        if diff.is_empty() {
            return Ok(());
        }
        Err(SnapshotError::ToolCallMismatch { loop_index, diff })
    }

    /// Verify a whole replayed run.
    ///
    /// Loops are visited in ascending order over the union of stored and
    /// live loop indices, so a loop present on only one side is reported as
    /// a mismatch against an empty list. The first mismatch is returned.
    pub fn verify_run(
        &self,
        stored: &[LoopRecord],
        live_events: &BTreeMap<usize, Vec<Value>>,
        live_loops: &BTreeMap<usize, LiveLoop>,
    ) -> Result<()> {
        let stored_by_loop: BTreeMap<usize, &LoopRecord> =
            stored.iter().map(|r| (r.loop_index, r)).collect();

        if self.config.verify_event_streams {
            let loops: BTreeSet<usize> = stored_by_loop
                .iter()
                .filter(|(_, r)| !r.events.is_empty())
                .map(|(i, _)| *i)
                .chain(live_events.keys().copied())
                .collect();

            for loop_index in loops {
                let expected = stored_by_loop
                    .get(&loop_index)
                    .map(|r| r.events.as_slice())
                    .unwrap_or_default();
                let actual = live_events
                    .get(&loop_index)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                self.verify_events(loop_index, expected, actual)?;
            }
        }

        if self.config.verify_tool_calls {
            let loops: BTreeSet<usize> = stored_by_loop
                .keys()
                .copied()
                .chain(live_loops.keys().copied())
                .collect();

            for loop_index in loops {
                let expected = stored_by_loop
                    .get(&loop_index)
                    .map(|r| r.tool_calls.as_slice())
                    .unwrap_or_default();
                let actual = live_loops
                    .get(&loop_index)
                    .map(|l| l.tool_calls.as_slice())
                    .unwrap_or_default();
                self.verify_tool_calls(loop_index, expected, actual)?;
            }
        }

        tracing::debug!(
            loops = stored.len(),
            events = self.config.verify_event_streams,
            tool_calls = self.config.verify_tool_calls,
            "Replay verification passed"
        );
        Ok(())
    }

    fn diff_normalized(&self, kind: PayloadKind, stored: &[Value], live: &[Value]) -> StructuralDiff {
        let expected = Value::Array(self.normalizer.normalize_all(kind, stored));
        let actual = Value::Array(self.normalizer.normalize_all(kind, live));
        StructuralDiff::compute(&expected, &actual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordedResponse;
    use serde_json::json;

    fn event(sequence: usize, kind: &str) -> Value {
        json!({
            "sequence": sequence,
            "loop_index": 0,
            "timestamp": "2026-01-01T00:00:00Z",
            "event": {"type": kind, "task_id": "t-1"}
        })
    }

    fn tool_call(name: &str, city: &str) -> Value {
        json!({
            "id": "call_1",
            "tool_name": name,
            "arguments": {"city": city},
            "result": {"sky": "clear"},
            "success": true,
            "duration_ms": 3
        })
    }

    #[test]
    fn test_merged_overrides() {
        let base = VerificationConfig::default();
        let merged = base.merged(&VerificationOverrides::default().with_event_streams(false));
        assert!(merged.verify_llm_requests);
        assert!(!merged.verify_event_streams);
        assert!(merged.verify_tool_calls);
        assert_eq!(base.merged(&VerificationOverrides::default()), base);
    }

    #[test]
    fn test_events_ignore_normalized_fields() {
        let normalizer = Normalizer::default();
        let verifier = Verifier::new(VerificationConfig::default(), &normalizer);

        let mut live = event(0, "turn_started");
        live["timestamp"] = json!("2027-05-05T10:00:00Z");
        live["event"]["task_id"] = json!("t-2");
        assert!(verifier.verify_events(0, &[event(0, "turn_started")], &[live]).is_ok());
    }

    #[test]
    fn test_event_mismatch_carries_path() {
        let normalizer = Normalizer::default();
        let verifier = Verifier::new(VerificationConfig::default(), &normalizer);

        let err = verifier
            .verify_events(
                2,
                &[event(0, "turn_started"), event(1, "turn_completed")],
                &[event(0, "turn_started")],
            )
            .unwrap_err();
        match err {
            SnapshotError::EventMismatch { loop_index, diff } => {
                assert_eq!(loop_index, 2);
                assert!(diff.at("[1]").is_some());
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_tool_call_mismatch() {
        let normalizer = Normalizer::default();
        let verifier = Verifier::new(VerificationConfig::default(), &normalizer);

        assert!(verifier
            .verify_tool_calls(0, &[tool_call("lookup", "Paris")], &[tool_call("lookup", "Paris")])
            .is_ok());

        let err = verifier
            .verify_tool_calls(0, &[tool_call("lookup", "Paris")], &[tool_call("lookup", "Rome")])
            .unwrap_err();
        let diff = err.diff().unwrap();
        let field = diff.at("[0].arguments.city").unwrap();
        assert_eq!(field.expected, Some(json!("Paris")));
        assert_eq!(field.actual, Some(json!("Rome")));
    }

    #[test]
    fn test_verify_run_respects_switches() {
        let normalizer = Normalizer::default();
        let mut record = LoopRecord::new(
            0,
            json!({}),
            RecordedResponse::Message(json!({"content": "ok"})),
        );
        record.events = vec![event(0, "turn_started")];
        record.tool_calls = vec![tool_call("lookup", "Paris")];

        let live_events = BTreeMap::new();
        let live_loops = BTreeMap::new();

        let all = Verifier::new(VerificationConfig::default(), &normalizer);
        assert!(matches!(
            all.verify_run(std::slice::from_ref(&record), &live_events, &live_loops),
            Err(SnapshotError::EventMismatch { loop_index: 0, .. })
        ));

        let tools_only = Verifier::new(
            VerificationConfig::default().merged(
                &VerificationOverrides::default().with_event_streams(false),
            ),
            &normalizer,
        );
        assert!(matches!(
            tools_only.verify_run(std::slice::from_ref(&record), &live_events, &live_loops),
            Err(SnapshotError::ToolCallMismatch { loop_index: 0, .. })
        ));

        let nothing = Verifier::new(VerificationConfig::none(), &normalizer);
        assert!(nothing
            .verify_run(&[record], &live_events, &live_loops)
            .is_ok());
    }
}
