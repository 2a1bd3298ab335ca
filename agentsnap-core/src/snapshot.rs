//! Snapshot orchestrator
//!
//! [`AgentSnapshot`] wraps an agent and drives it in one of two modes:
//!
//! - **generate**: run the agent against its real LLM client and record one
//!   loop record per LLM call into the configured case.
//! - **replay**: swap the client for a [`ReplayLlmClient`] serving the
//!   recorded responses, verify the live run against the records and report
//!   the first divergence. In update mode the live run replaces the case.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentsnap_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(agent: Arc<LoopAgent>) -> agentsnap_core::Result<()> {
//! let config = SnapshotConfig::new("tests/snapshots", "weather_paris");
//! let snapshot = AgentSnapshot::new(agent, config)?;
//!
//! snapshot.generate("What is the weather in Paris?").await?;
//! let result = snapshot.replay("What is the weather in Paris?", None).await?;
//! println!("{} loops replayed", result.loop_count);
//! # Ok(())
//! # }
//! ```
//!
//! [`ReplayLlmClient`]: crate::replay::ReplayLlmClient

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentInput, LoopHooks, RunMode, SnapshotAgent};
use crate::config::SnapshotConfig;
use crate::error::{Result, SnapshotError};
use crate::events::{EventEnvelope, group_by_loop};
use crate::hooks::{GenerateHook, persist_live_run};
use crate::llm::LlmClient;
use crate::normalize::{Normalizer, NormalizerConfig, PayloadKind};
use crate::record::{LoopRecord, RecordedResponse};
use crate::replay::{ReplayConfig, ReplayHook};
use crate::session::{RunSession, SnapshotMode};
use crate::store::{FsSnapshotStore, SnapshotStore, ensure_contiguous};
use crate::verify::{VerificationOverrides, Verifier};

/// Callback observing each event of a run as it is consumed
pub type EventObserver = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

/// Options of a single generate or replay call
#[derive(Clone)]
pub struct RunOptions {
    pub input: AgentInput,
    pub mode: RunMode,
    pub cancel: CancellationToken,
    pub observer: Option<EventObserver>,
}

impl RunOptions {
    /// Drive the agent with a blocking `run`
    pub fn blocking(input: impl Into<AgentInput>) -> Self {
        Self {
            input: input.into(),
            mode: RunMode::Blocking,
            cancel: CancellationToken::new(),
            observer: None,
        }
    }

    /// Drive the agent through its event stream
    pub fn streaming(input: impl Into<AgentInput>) -> Self {
        Self {
            mode: RunMode::Streaming,
            ..Self::blocking(input)
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: impl Fn(&EventEnvelope) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }
}

impl From<&str> for RunOptions {
    fn from(prompt: &str) -> Self {
        Self::blocking(prompt)
    }
}

impl From<String> for RunOptions {
    fn from(prompt: String) -> Self {
        Self::blocking(prompt)
    }
}

impl From<AgentInput> for RunOptions {
    fn from(input: AgentInput) -> Self {
        Self::blocking(input)
    }
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("input", &self.input)
            .field("mode", &self.mode)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Per-call replay overrides layered over the instance configuration
#[derive(Debug, Clone, Default)]
pub struct ReplayOverrides {
    pub normalizer: Option<NormalizerConfig>,
    pub verification: VerificationOverrides,
    pub update_snapshots: Option<bool>,
}

impl ReplayOverrides {
    pub fn with_normalizer(mut self, normalizer: NormalizerConfig) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    pub fn with_verification(mut self, verification: VerificationOverrides) -> Self {
        self.verification = verification;
        self
    }

    pub fn with_update_snapshots(mut self, update: bool) -> Self {
        self.update_snapshots = Some(update);
        self
    }
}

/// Metadata of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub case_name: String,
    pub mode: SnapshotMode,
    pub run_mode: RunMode,
    pub started_at: DateTime<Utc>,
    #[serde(with = "humantime_serde")]
    pub execution_time: Duration,
    pub loop_count: usize,
    /// True when replay rewrote the case from the live run
    pub updated: bool,
}

/// Outcome of a generate or replay call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResult {
    /// Location of the case artifacts
    pub artifacts_path: String,
    pub loop_count: usize,
    /// Final response text of the agent
    pub response: String,
    pub events: Vec<EventEnvelope>,
    pub meta: SnapshotMeta,
}

/// Client and hooks installed on the agent for the duration of a run.
///
/// Dropping the installation restores the original client and removes the
/// hooks, including when the run future is dropped early.
struct Installation<'a, A: SnapshotAgent + ?Sized> {
    agent: &'a A,
    original: Arc<dyn LlmClient>,
}

impl<'a, A: SnapshotAgent + ?Sized> Installation<'a, A> {
    fn install(
        agent: &'a A,
        client: Option<Arc<dyn LlmClient>>,
        hooks: Arc<dyn LoopHooks>,
    ) -> Self {
        let original = agent.llm_client();
        if let Some(client) = client {
            agent.set_llm_client(client);
        }
        agent.set_hooks(Some(hooks));
        Self { agent, original }
    }
}

impl<A: SnapshotAgent + ?Sized> Drop for Installation<'_, A> {
    fn drop(&mut self) {
        self.agent.set_hooks(None);
        self.agent.set_llm_client(Arc::clone(&self.original));
    }
}

/// Record-and-replay harness around one agent
pub struct AgentSnapshot<A: SnapshotAgent + ?Sized> {
    agent: Arc<A>,
    store: Arc<dyn SnapshotStore>,
    config: SnapshotConfig,
    normalizer: Arc<Normalizer>,
    current_loop: Arc<AtomicUsize>,
    run_lock: Mutex<()>,
}

impl<A: SnapshotAgent + ?Sized> AgentSnapshot<A> {
    /// Create a harness storing cases under `config.snapshot_dir`
    pub fn new(agent: Arc<A>, config: SnapshotConfig) -> Result<Self> {
        let store: Arc<dyn SnapshotStore> = Arc::new(FsSnapshotStore::new(&config.snapshot_dir));
        Self::with_store(agent, config, store)
    }

    /// Create a harness over an explicit store
    pub fn with_store(
        agent: Arc<A>,
        config: SnapshotConfig,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self> {
        config.validate()?;
        let normalizer = Arc::new(Normalizer::new(config.normalizer.clone())?);
        Ok(Self {
            agent,
            store,
            config,
            normalizer,
            current_loop: Arc::new(AtomicUsize::new(0)),
            run_lock: Mutex::new(()),
        })
    }

    /// Record the configured case from a live run.
    ///
    /// Any existing loops of the case are removed first.
    pub async fn generate(&self, options: impl Into<RunOptions>) -> Result<SnapshotResult> {
        let options = options.into();
        let _running = self.run_lock.lock().await;
        let case = self.case_name();

        tracing::info!(case = %case, run_mode = %options.mode, "Generating snapshot");
        self.store.clear_case(case)?;

        let session = Arc::new(RunSession::new(
            case,
            SnapshotMode::Generate,
            Arc::clone(&self.current_loop),
        ));
        let hook = Arc::new(GenerateHook::new(
            Arc::clone(&self.store),
            Arc::clone(&self.normalizer),
            Arc::clone(&session),
        ));

        let outcome = {
            let _installed = Installation::install(
                self.agent.as_ref(),
                None,
                Arc::clone(&hook) as Arc<dyn LoopHooks>,
            );
            self.drive(&session, &options).await
        };

        let (response, events) = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    case = %case,
                    error = %err,
                    "Generation failed, case left without a manifest"
                );
                return Err(err);
            }
        };

        let loop_count = hook.finish(&events, options.mode)?;
        Ok(self.result(&session, options.mode, response, events, loop_count, false))
    }

    /// Replay the configured case and verify the live run against it.
    ///
    /// `overrides` are merged over the instance configuration for this call
    /// only. Fails with [`SnapshotError::SnapshotNotFound`] before the agent
    /// runs when the case does not exist.
    pub async fn replay(
        &self,
        options: impl Into<RunOptions>,
        overrides: Option<ReplayOverrides>,
    ) -> Result<SnapshotResult> {
        let options = options.into();
        let overrides = overrides.unwrap_or_default();
        let _running = self.run_lock.lock().await;
        let case = self.case_name();

        let config = self.replay_config(&overrides)?;

        if !self.store.case_exists(case)? {
            return Err(SnapshotError::SnapshotNotFound {
                case: case.to_string(),
                location: self.store.location(case),
            });
        }

        let removed = self.store.cleanup_transient(case)?;
        if removed > 0 {
            tracing::debug!(case = %case, removed = removed, "Removed transient artifacts");
        }

        let stored = self.store.read_all(case)?;
        let expected = stored.len();
        tracing::info!(
            case = %case,
            expected = expected,
            run_mode = %options.mode,
            update = config.update_snapshots,
            "Replaying snapshot"
        );

        let session = Arc::new(RunSession::new(
            case,
            SnapshotMode::Replay,
            Arc::clone(&self.current_loop),
        ));
        let hook = Arc::new(ReplayHook::setup(
            Arc::clone(&self.store),
            Arc::clone(&session),
            expected,
            config.clone(),
            Some(self.agent.llm_client()),
        )?);

        let outcome = {
            let _installed = Installation::install(
                self.agent.as_ref(),
                Some(hook.client() as Arc<dyn LlmClient>),
                Arc::clone(&hook) as Arc<dyn LoopHooks>,
            );
            self.drive(&session, &options).await
        };
        let executed = self.agent.executed_loops();

        let (response, events) = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                self.write_actual(&session, &config.normalizer, &err, executed);
                return Err(err);
            }
        };

        let verdict = if executed != expected {
            Err(SnapshotError::LoopCountMismatch {
                expected,
                actual: executed,
            })
        } else {
            let live_events = group_by_loop(&events)?;
            Verifier::new(config.verification, &config.normalizer).verify_run(
                &stored,
                &live_events,
                &session.live_loops(),
            )
        };

        if config.update_snapshots {
            if let Err(err) = &verdict {
                tracing::info!(case = %case, error = %err, "Divergence accepted in update mode");
            }
            let written = persist_live_run(
                self.store.as_ref(),
                &config.normalizer,
                &session,
                &events,
                options.mode,
            )?;
            self.store.truncate(case, written)?;
            tracing::info!(
                case = %case,
                previous = expected,
                loops = written,
                "Snapshot case updated from live run"
            );
            return Ok(self.result(&session, options.mode, response, events, written, true));
        }

        if let Err(err) = verdict {
            self.write_actual(&session, &config.normalizer, &err, executed);
            return Err(err);
        }

        tracing::info!(case = %case, loops = executed, "Replay matched snapshot");
        Ok(self.result(&session, options.mode, response, events, executed, false))
    }

    /// Loop the current (or most recent) run reached
    pub fn current_loop(&self) -> usize {
        self.current_loop.load(Ordering::SeqCst)
    }

    pub fn agent(&self) -> &Arc<A> {
        &self.agent
    }

    /// Replace the instance normalizer configuration
    pub fn update_normalizer_config(&mut self, config: NormalizerConfig) -> Result<()> {
        self.normalizer = Arc::new(Normalizer::new(config.clone())?);
        self.config.normalizer = config;
        Ok(())
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    pub fn case_name(&self) -> &str {
        &self.config.case_name
    }

    /// Number of loops recorded in the case
    pub fn expected_loops(&self) -> Result<usize> {
        let indices = self.store.loop_indices(self.case_name())?;
        let keyed: BTreeMap<usize, ()> = indices.iter().map(|i| (*i, ())).collect();
        ensure_contiguous(self.case_name(), &keyed)?;
        Ok(indices.len())
    }

    fn replay_config(&self, overrides: &ReplayOverrides) -> Result<ReplayConfig> {
        let normalizer = match &overrides.normalizer {
            Some(config) => Arc::new(Normalizer::new(config.clone())?),
            None => Arc::clone(&self.normalizer),
        };
        Ok(ReplayConfig {
            normalizer,
            verification: self.config.verification.merged(&overrides.verification),
            update_snapshots: overrides
                .update_snapshots
                .unwrap_or(self.config.update_snapshots),
        })
    }

    /// Run the agent in the requested mode and collect its outcome.
    ///
    /// A session failure takes precedence over the error the agent surfaced,
    /// and cancellation takes precedence over both.
    async fn drive(
        &self,
        session: &RunSession,
        options: &RunOptions,
    ) -> Result<(String, Vec<EventEnvelope>)> {
        let cancel = &options.cancel;
        let terminal = match options.mode {
            RunMode::Blocking => {
                let outcome = self
                    .agent
                    .run(options.input.clone(), cancel.clone())
                    .await;
                if cancel.is_cancelled() {
                    return Err(SnapshotError::Cancelled {
                        loop_index: session.current_loop(),
                    });
                }
                if let Some(err) = session.last_error() {
                    return Err(err);
                }
                let terminal = outcome?;
                if let Some(observer) = &options.observer {
                    for envelope in self.agent.events() {
                        observer(&envelope);
                    }
                }
                terminal
            }
            RunMode::Streaming => {
                let mut stream = match self
                    .agent
                    .run_stream(options.input.clone(), cancel.clone())
                    .await
                {
                    Ok(stream) => stream,
                    Err(err) => return Err(resolve_failure(session, cancel, err)),
                };

                let mut terminal = None;
                while let Some(item) = stream.next().await {
                    let envelope = match item {
                        Ok(envelope) => envelope,
                        Err(err) => return Err(resolve_failure(session, cancel, err)),
                    };
                    if let Some(observer) = &options.observer {
                        observer(&envelope);
                    }
                    if cancel.is_cancelled() {
                        return Err(SnapshotError::Cancelled {
                            loop_index: session.current_loop(),
                        });
                    }
                    if let Some(err) = session.last_error() {
                        return Err(err);
                    }
                    if envelope.event.is_terminal() {
                        terminal = Some(envelope.event);
                    }
                }

                terminal.ok_or_else(|| {
                    SnapshotError::Agent("event stream ended without task completion".to_string())
                })?
            }
        };

        let response = terminal.final_response().unwrap_or_default().to_string();
        Ok((response, self.agent.events()))
    }

    /// Write the live capture of the failing loop next to its record
    fn write_actual(
        &self,
        session: &RunSession,
        normalizer: &Normalizer,
        err: &SnapshotError,
        executed: usize,
    ) {
        if !err.is_mismatch() {
            return;
        }
        let loop_index = err.loop_index().unwrap_or(executed.saturating_sub(1));
        let Some(live) = session.live_loop(loop_index) else {
            return;
        };

        let events = group_by_loop(&self.agent.events())
            .ok()
            .and_then(|mut grouped| grouped.remove(&loop_index))
            .map(|events| normalizer.normalize_all(PayloadKind::Event, &events))
            .unwrap_or_default();
        let record = LoopRecord {
            loop_index,
            request: live.request.unwrap_or_default(),
            response: live
                .response
                .unwrap_or(RecordedResponse::Message(serde_json::Value::Null)),
            events,
            tool_calls: live.tool_calls,
        };

        match self.store.write_actual(session.case(), &record) {
            Ok(()) => tracing::warn!(
                case = %session.case(),
                loop_index = loop_index,
                location = %self.store.location(session.case()),
                "Live capture of the failing loop written for diffing"
            ),
            Err(write_err) => tracing::error!(
                case = %session.case(),
                loop_index = loop_index,
                error = %write_err,
                "Failed to write live capture"
            ),
        }
    }

    fn result(
        &self,
        session: &RunSession,
        run_mode: RunMode,
        response: String,
        events: Vec<EventEnvelope>,
        loop_count: usize,
        updated: bool,
    ) -> SnapshotResult {
        SnapshotResult {
            artifacts_path: self.store.location(session.case()),
            loop_count,
            response,
            events,
            meta: SnapshotMeta {
                case_name: session.case().to_string(),
                mode: session.mode(),
                run_mode,
                started_at: session.started_at(),
                execution_time: session.elapsed(),
                loop_count,
                updated,
            },
        }
    }
}

impl<A: SnapshotAgent + ?Sized> std::fmt::Debug for AgentSnapshot<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSnapshot")
            .field("case_name", &self.config.case_name)
            .field("snapshot_dir", &self.config.snapshot_dir)
            .field("current_loop", &self.current_loop())
            .finish()
    }
}

/// Pick the error reported for a failed run
fn resolve_failure(
    session: &RunSession,
    cancel: &CancellationToken,
    err: SnapshotError,
) -> SnapshotError {
    if cancel.is_cancelled() {
        return SnapshotError::Cancelled {
            loop_index: session.current_loop(),
        };
    }
    session.last_error().unwrap_or(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LoopAgent;
    use crate::llm::{LlmResponse, ScriptedLlmClient};
    use crate::store::InMemorySnapshotStore;

    fn agent(responses: Vec<LlmResponse>) -> Arc<LoopAgent> {
        Arc::new(
            LoopAgent::builder()
                .name("echo")
                .llm_client(Arc::new(ScriptedLlmClient::new(responses)))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SnapshotConfig::default().with_case_name("");
        let result = AgentSnapshot::with_store(
            agent(vec![]),
            config,
            Arc::new(InMemorySnapshotStore::new()),
        );
        assert!(matches!(result, Err(SnapshotError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_generate_restores_agent() {
        let agent = agent(vec![LlmResponse::text("hi")]);
        let original = agent.llm_client();
        let store = Arc::new(InMemorySnapshotStore::new());
        let snapshot = AgentSnapshot::with_store(
            Arc::clone(&agent),
            SnapshotConfig::default().with_case_name("restore"),
            store.clone(),
        )
        .unwrap();

        let result = snapshot.generate("hello").await.unwrap();
        assert_eq!(result.response, "hi");
        assert_eq!(result.loop_count, 1);
        assert_eq!(result.meta.mode, SnapshotMode::Generate);
        assert_eq!(result.artifacts_path, "memory://restore");
        assert!(Arc::ptr_eq(&agent.llm_client(), &original));
        assert_eq!(snapshot.expected_loops().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replay_restores_agent_after_failure() {
        let agent = agent(vec![]);
        let original = agent.llm_client();
        let store = Arc::new(InMemorySnapshotStore::new());
        store.create_case("default");
        let snapshot =
            AgentSnapshot::with_store(Arc::clone(&agent), SnapshotConfig::default(), store).unwrap();

        let err = snapshot.replay("hello", None).await.unwrap_err();
        assert!(matches!(err, SnapshotError::UnexpectedLoop { .. }));
        assert!(Arc::ptr_eq(&agent.llm_client(), &original));
    }

    #[test]
    fn test_update_normalizer_config() {
        let mut snapshot = AgentSnapshot::with_store(
            agent(vec![]),
            SnapshotConfig::default(),
            Arc::new(InMemorySnapshotStore::new()),
        )
        .unwrap();

        snapshot
            .update_normalizer_config(NormalizerConfig::bare())
            .unwrap();
        assert!(!snapshot.config().normalizer.use_defaults);

        let bad = NormalizerConfig::bare().with_rule(crate::normalize::FieldRule::drop(""));
        assert!(snapshot.update_normalizer_config(bad).is_err());
    }
}
