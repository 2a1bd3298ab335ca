//! Per-run session state
//!
//! One [`RunSession`] exists per `generate`/`replay` call. The hooks and the
//! replay client hold it behind an `Arc`; the orchestrator drops it when the
//! run ends, which also drops any outstanding failure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::SnapshotError;
use crate::record::{LoopRecord, RecordedResponse};

/// Which path of the orchestrator a run takes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    Generate,
    Replay,
}

impl std::fmt::Display for SnapshotMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotMode::Generate => write!(f, "generate"),
            SnapshotMode::Replay => write!(f, "replay"),
        }
    }
}

/// Live artifacts captured for one loop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveLoop {
    pub request: Option<Value>,
    pub response: Option<RecordedResponse>,
    pub tool_calls: Vec<Value>,
}

impl LiveLoop {
    /// Build a record once both the request and the response are known
    pub fn to_record(&self, loop_index: usize, events: Vec<Value>) -> Option<LoopRecord> {
        Some(LoopRecord {
            loop_index,
            request: self.request.clone()?,
            response: self.response.clone()?,
            events,
            tool_calls: self.tool_calls.clone(),
        })
    }
}

/// State shared by the participants of one run
#[derive(Debug)]
pub struct RunSession {
    case: String,
    mode: SnapshotMode,
    started_at: DateTime<Utc>,
    started: Instant,
    current_loop: Arc<AtomicUsize>,
    failure: Mutex<Option<SnapshotError>>,
    live: Mutex<BTreeMap<usize, LiveLoop>>,
}

impl RunSession {
    /// Start a session; the loop pointer is reset to 0
    pub fn new(case: impl Into<String>, mode: SnapshotMode, current_loop: Arc<AtomicUsize>) -> Self {
        current_loop.store(0, Ordering::SeqCst);
        Self {
            case: case.into(),
            mode,
            started_at: Utc::now(),
            started: Instant::now(),
            current_loop,
            failure: Mutex::new(None),
            live: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn case(&self) -> &str {
        &self.case
    }

    pub fn mode(&self) -> SnapshotMode {
        self.mode
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Loop the run is currently at
    pub fn current_loop(&self) -> usize {
        self.current_loop.load(Ordering::SeqCst)
    }

    pub fn set_current_loop(&self, loop_index: usize) {
        self.current_loop.store(loop_index, Ordering::SeqCst);
    }

    /// Move the pointer past `loop_index`; a no-op if it already moved
    pub fn advance_past(&self, loop_index: usize) {
        let _ = self.current_loop.compare_exchange(
            loop_index,
            loop_index + 1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Record a failure; only the first one is kept
    pub fn fail(&self, error: SnapshotError) {
        let mut slot = lock(&self.failure);
        if slot.is_none() {
            tracing::error!(
                case = %self.case,
                mode = %self.mode,
                loop_index = ?error.loop_index(),
                error = %error,
                "Snapshot run failed"
            );
            *slot = Some(error);
        }
    }

    pub fn has_error(&self) -> bool {
        lock(&self.failure).is_some()
    }

    pub fn last_error(&self) -> Option<SnapshotError> {
        lock(&self.failure).clone()
    }

    pub fn clear_error(&self) {
        lock(&self.failure).take();
    }

    pub fn stage_request(&self, loop_index: usize, request: Value) {
        lock(&self.live).entry(loop_index).or_default().request = Some(request);
    }

    pub fn stage_response(&self, loop_index: usize, response: RecordedResponse) {
        lock(&self.live).entry(loop_index).or_default().response = Some(response);
    }

    pub fn push_tool_call(&self, loop_index: usize, call: Value) {
        lock(&self.live)
            .entry(loop_index)
            .or_default()
            .tool_calls
            .push(call);
    }

    pub fn live_loop(&self, loop_index: usize) -> Option<LiveLoop> {
        lock(&self.live).get(&loop_index).cloned()
    }

    /// Every live capture of the run, by loop index
    pub fn live_loops(&self) -> BTreeMap<usize, LiveLoop> {
        lock(&self.live).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
