//! Snapshot storage
//!
//! A snapshot case is an ordered sequence of loop records. On disk a case
//! looks like:
//!
//! ```text
//! <snapshot_dir>/<case>/
//!     case.json
//!     loop-0/request.json
//!     loop-0/response.json
//!     loop-0/events.json
//!     loop-0/tool_calls.json
//!     loop-1/...
//!     loop-10/...
//! ```
//!
//! Loop entries are ordered by the integer in their name, never by string
//! order, and must be contiguous from 0. `actual-*.json` files next to the
//! canonical artifacts are transient live captures written when a replay
//! fails.

use std::collections::BTreeMap;

use crate::error::{Result, SnapshotError};
use crate::record::{CaseManifest, LoopRecord};

mod fs;
mod memory;

pub use fs::FsSnapshotStore;
pub use memory::InMemorySnapshotStore;

/// Prefix of loop entry names
pub const LOOP_PREFIX: &str = "loop-";
/// Prefix of transient live-capture artifacts
pub const ACTUAL_PREFIX: &str = "actual-";

pub const REQUEST_FILE: &str = "request.json";
pub const RESPONSE_FILE: &str = "response.json";
pub const EVENTS_FILE: &str = "events.json";
pub const TOOL_CALLS_FILE: &str = "tool_calls.json";
pub const MANIFEST_FILE: &str = "case.json";

/// Parse the loop index out of an entry name such as `loop-10`.
///
/// Only the canonical spelling written by [`loop_entry_name`] matches, so
/// `loop-01` is not an alias of `loop-1`.
pub fn parse_loop_index(name: &str) -> Option<usize> {
    let digits = name.strip_prefix(LOOP_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

/// Entry name of a loop index
pub fn loop_entry_name(loop_index: usize) -> String {
    format!("{}{}", LOOP_PREFIX, loop_index)
}

/// Check that sorted loop indices run 0, 1, ..., N-1
pub fn ensure_contiguous<V>(case: &str, loops: &BTreeMap<usize, V>) -> Result<()> {
    for (expected, index) in loops.keys().enumerate() {
        if *index != expected {
            return Err(SnapshotError::CorruptSnapshot(format!(
                "case '{}' is missing {} (found {} next)",
                case,
                loop_entry_name(expected),
                loop_entry_name(*index)
            )));
        }
    }
    Ok(())
}

/// Persistent storage for snapshot cases.
///
/// Implementations must be safe to share between the orchestrator, the
/// generate hook and the replay client of one run.
pub trait SnapshotStore: Send + Sync {
    /// Whether the case exists (possibly with zero loops)
    fn case_exists(&self, case: &str) -> Result<bool>;

    /// Loop indices present in the case, in ascending numeric order
    fn loop_indices(&self, case: &str) -> Result<Vec<usize>>;

    /// Number of loop records in the case
    fn count(&self, case: &str) -> Result<usize> {
        Ok(self.loop_indices(case)?.len())
    }

    /// Read one loop record
    fn read(&self, case: &str, loop_index: usize) -> Result<LoopRecord>;

    /// Persist a loop record, creating the case if absent
    fn write(&self, case: &str, record: &LoopRecord) -> Result<()>;

    /// Persist a live capture next to the canonical record for diffing
    fn write_actual(&self, case: &str, record: &LoopRecord) -> Result<()>;

    /// Remove transient artifacts; returns how many were removed
    fn cleanup_transient(&self, case: &str) -> Result<usize>;

    /// Remove the whole case
    fn clear_case(&self, case: &str) -> Result<()>;

    /// Remove every loop with an index of `keep` or more
    fn truncate(&self, case: &str, keep: usize) -> Result<()>;

    /// Names of all stored cases, sorted
    fn list_cases(&self) -> Result<Vec<String>>;

    fn read_manifest(&self, case: &str) -> Result<Option<CaseManifest>>;

    fn write_manifest(&self, case: &str, manifest: &CaseManifest) -> Result<()>;

    /// Human-readable location of the case (a path for on-disk stores)
    fn location(&self, case: &str) -> String;

    /// Read every loop of the case after checking contiguity
    fn read_all(&self, case: &str) -> Result<Vec<LoopRecord>> {
        let indices = self.loop_indices(case)?;
        let keyed: BTreeMap<usize, ()> = indices.iter().map(|i| (*i, ())).collect();
        ensure_contiguous(case, &keyed)?;
        indices.into_iter().map(|i| self.read(case, i)).collect()
    }
}
