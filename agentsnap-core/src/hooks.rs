//! Generate-mode boundary hooks
//!
//! [`GenerateHook`] observes a live run and writes one loop record per LLM
//! boundary. The real response is never altered. Events are only known in
//! full once the run ends, so [`GenerateHook::finish`] rewrites each record
//! with the events attributed to its loop.

use async_trait::async_trait;
use std::sync::Arc;

use crate::agent::{HookResult, LoopHooks, RunMode, ToolCallRecord};
use crate::error::{Result, SnapshotError};
use crate::events::{EventEnvelope, group_by_loop};
use crate::llm::{LlmChunk, LlmRequest, LlmResponse};
use crate::normalize::{Normalizer, PayloadKind};
use crate::record::{CaseManifest, RecordedResponse};
use crate::session::RunSession;
use crate::store::{REQUEST_FILE, RESPONSE_FILE, SnapshotStore};

/// Hook recording a live run into a snapshot case
pub struct GenerateHook {
    store: Arc<dyn SnapshotStore>,
    normalizer: Arc<Normalizer>,
    session: Arc<RunSession>,
}

impl GenerateHook {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        normalizer: Arc<Normalizer>,
        session: Arc<RunSession>,
    ) -> Self {
        Self {
            store,
            normalizer,
            session,
        }
    }

    pub fn session(&self) -> &Arc<RunSession> {
        &self.session
    }

    /// Boundaries after a failure are not processed
    fn guard(&self) -> HookResult {
        match self.session.last_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Capture a failure in the session and hand it back to the agent
    fn settle(&self, result: Result<()>) -> HookResult {
        if let Err(err) = &result {
            self.session.fail(err.clone());
        }
        result
    }

    /// Write the current state of a loop's record
    fn flush(&self, loop_index: usize) -> Result<()> {
        let live = self.session.live_loop(loop_index).unwrap_or_default();
        let record = live.to_record(loop_index, Vec::new()).ok_or_else(|| {
            let missing = if live.request.is_none() {
                REQUEST_FILE
            } else {
                RESPONSE_FILE
            };
            SnapshotError::IncompleteLoop {
                loop_index,
                missing: missing.to_string(),
            }
        })?;
        self.store.write(self.session.case(), &record)
    }

    fn record_response(&self, loop_index: usize, response: RecordedResponse) -> Result<()> {
        self.session.stage_response(loop_index, response);
        self.flush(loop_index)?;
        tracing::debug!(
            case = %self.session.case(),
            loop_index = loop_index,
            "Recorded LLM response"
        );
        Ok(())
    }

    /// Attach events to their loops and write the case manifest.
    ///
    /// Returns the number of loop records written.
    pub fn finish(&self, events: &[EventEnvelope], mode: RunMode) -> Result<usize> {
        let written = persist_live_run(
            self.store.as_ref(),
            &self.normalizer,
            &self.session,
            events,
            mode,
        )?;
        tracing::info!(case = %self.session.case(), loops = written, "Snapshot case recorded");
        Ok(written)
    }
}

/// Write every complete live loop of a session with its events, then the
/// case manifest. Returns the number of loop records written.
pub(crate) fn persist_live_run(
    store: &dyn SnapshotStore,
    normalizer: &Normalizer,
    session: &RunSession,
    events: &[EventEnvelope],
    mode: RunMode,
) -> Result<usize> {
    let case = session.case();
    let grouped = group_by_loop(events)?;
    let live = session.live_loops();

    let mut written = 0;
    for (loop_index, capture) in &live {
        let loop_events = grouped
            .get(loop_index)
            .map(|events| normalizer.normalize_all(PayloadKind::Event, events))
            .unwrap_or_default();

        match capture.to_record(*loop_index, loop_events) {
            Some(record) => {
                store.write(case, &record)?;
                written += 1;
            }
            None => tracing::warn!(
                case = %case,
                loop_index = *loop_index,
                "Loop never received a response, not recorded"
            ),
        }
    }

    for loop_index in grouped.keys().filter(|i| !live.contains_key(i)) {
        tracing::warn!(
            case = %case,
            loop_index = *loop_index,
            "Events emitted for a loop without an LLM call were not recorded"
        );
    }

    store.write_manifest(case, &CaseManifest::new(case, written, mode))?;
    Ok(written)
}

#[async_trait]
impl LoopHooks for GenerateHook {
    async fn before_llm_request(&self, loop_index: usize, request: &LlmRequest) -> HookResult {
        self.guard()?;
        self.session.set_current_loop(loop_index);
        let result = self
            .normalizer
            .normalize_serialize(PayloadKind::Request, request)
            .map(|normalized| self.session.stage_request(loop_index, normalized));
        self.settle(result)
    }

    async fn after_llm_response(&self, loop_index: usize, response: &LlmResponse) -> HookResult {
        self.guard()?;
        let result = self
            .normalizer
            .normalize_serialize(PayloadKind::Response, response)
            .and_then(|normalized| {
                self.record_response(loop_index, RecordedResponse::Message(normalized))
            });
        self.settle(result)
    }

    async fn after_llm_stream(&self, loop_index: usize, chunks: &[LlmChunk]) -> HookResult {
        self.guard()?;
        let result = chunks
            .iter()
            .map(|chunk| {
                self.normalizer
                    .normalize_serialize(PayloadKind::Response, chunk)
            })
            .collect::<Result<Vec<_>>>()
            .and_then(|normalized| {
                self.record_response(loop_index, RecordedResponse::Chunks(normalized))
            });
        self.settle(result)
    }

    async fn after_tool_call(&self, loop_index: usize, call: &ToolCallRecord) -> HookResult {
        self.guard()?;
        let result = self
            .normalizer
            .normalize_serialize(PayloadKind::ToolCall, call)
            .and_then(|normalized| {
                self.session.push_tool_call(loop_index, normalized);
                self.flush(loop_index)
            });
        self.settle(result)
    }
}
