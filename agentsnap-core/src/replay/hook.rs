//! Replay-mode boundary hooks

use async_trait::async_trait;
use std::sync::Arc;

use super::{ReplayConfig, ReplayLlmClient};
use crate::agent::{HookResult, LoopHooks, ToolCallRecord};
use crate::error::{Result, SnapshotError};
use crate::llm::{LlmChunk, LlmClient, LlmRequest, LlmResponse};
use crate::normalize::PayloadKind;
use crate::session::RunSession;
use crate::store::SnapshotStore;

/// Hook pairing a replayed run with its mock client
pub struct ReplayHook {
    session: Arc<RunSession>,
    config: ReplayConfig,
    client: Arc<ReplayLlmClient>,
}

impl ReplayHook {
    /// Prepare a replay of the session's case.
    ///
    /// Fails with [`SnapshotError::SnapshotNotFound`] when the case does not
    /// exist. The loop pointer is reset to 0. `fallback` answers requests
    /// past the recorded loops in update mode.
    pub fn setup(
        store: Arc<dyn SnapshotStore>,
        session: Arc<RunSession>,
        expected_loops: usize,
        config: ReplayConfig,
        fallback: Option<Arc<dyn LlmClient>>,
    ) -> Result<Self> {
        let case = session.case();
        if !store.case_exists(case)? {
            return Err(SnapshotError::SnapshotNotFound {
                case: case.to_string(),
                location: store.location(case),
            });
        }

        session.set_current_loop(0);
        tracing::debug!(
            case = %case,
            expected = expected_loops,
            update = config.update_snapshots,
            "Replay hook installed"
        );

        let client = Arc::new(ReplayLlmClient::new(
            store,
            Arc::clone(&session),
            config.clone(),
            expected_loops,
            fallback,
        ));

        Ok(Self {
            session,
            config,
            client,
        })
    }

    /// Mock client to install on the agent
    pub fn client(&self) -> Arc<ReplayLlmClient> {
        Arc::clone(&self.client)
    }

    pub fn session(&self) -> &Arc<RunSession> {
        &self.session
    }

    fn guard(&self) -> HookResult {
        match self.session.last_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LoopHooks for ReplayHook {
    async fn before_llm_request(&self, _loop_index: usize, _request: &LlmRequest) -> HookResult {
        self.guard()
    }

    async fn after_llm_response(&self, _loop_index: usize, _response: &LlmResponse) -> HookResult {
        self.guard()
    }

    async fn after_llm_stream(&self, _loop_index: usize, _chunks: &[LlmChunk]) -> HookResult {
        self.guard()
    }

    async fn after_tool_call(&self, loop_index: usize, call: &ToolCallRecord) -> HookResult {
        self.guard()?;
        match self
            .config
            .normalizer
            .normalize_serialize(PayloadKind::ToolCall, call)
        {
            Ok(normalized) => {
                self.session.push_tool_call(loop_index, normalized);
                Ok(())
            }
            Err(err) => {
                self.session.fail(err.clone());
                Err(err)
            }
        }
    }
}
