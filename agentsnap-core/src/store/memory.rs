//! In-memory snapshot store for tests

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::SnapshotStore;
use crate::error::{Result, SnapshotError};
use crate::record::{CaseManifest, LoopRecord};

#[derive(Debug, Default, Clone)]
struct MemoryCase {
    loops: BTreeMap<usize, LoopRecord>,
    actual: BTreeMap<usize, LoopRecord>,
    manifest: Option<CaseManifest>,
}

/// Snapshot store keeping cases in memory
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    cases: Mutex<BTreeMap<String, MemoryCase>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty case (zero loops)
    pub fn create_case(&self, case: &str) {
        self.lock().entry(case.to_string()).or_default();
    }

    /// Live capture stored for a loop, if any
    pub fn actual(&self, case: &str, loop_index: usize) -> Option<LoopRecord> {
        self.lock()
            .get(case)
            .and_then(|c| c.actual.get(&loop_index).cloned())
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MemoryCase>> {
        self.cases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn case_exists(&self, case: &str) -> Result<bool> {
        Ok(self.lock().contains_key(case))
    }

    fn loop_indices(&self, case: &str) -> Result<Vec<usize>> {
        Ok(self
            .lock()
            .get(case)
            .map(|c| c.loops.keys().copied().collect())
            .unwrap_or_default())
    }

    fn read(&self, case: &str, loop_index: usize) -> Result<LoopRecord> {
        self.lock()
            .get(case)
            .and_then(|c| c.loops.get(&loop_index).cloned())
            .ok_or_else(|| SnapshotError::SnapshotNotFound {
                case: case.to_string(),
                location: format!("{}/loop-{}", self.location(case), loop_index),
            })
    }

    fn write(&self, case: &str, record: &LoopRecord) -> Result<()> {
        self.lock()
            .entry(case.to_string())
            .or_default()
            .loops
            .insert(record.loop_index, record.clone());
        Ok(())
    }

    fn write_actual(&self, case: &str, record: &LoopRecord) -> Result<()> {
        self.lock()
            .entry(case.to_string())
            .or_default()
            .actual
            .insert(record.loop_index, record.clone());
        Ok(())
    }

    fn cleanup_transient(&self, case: &str) -> Result<usize> {
        Ok(self
            .lock()
            .get_mut(case)
            .map(|c| std::mem::take(&mut c.actual).len())
            .unwrap_or(0))
    }

    fn clear_case(&self, case: &str) -> Result<()> {
        self.lock().remove(case);
        Ok(())
    }

    fn truncate(&self, case: &str, keep: usize) -> Result<()> {
        if let Some(c) = self.lock().get_mut(case) {
            c.loops.retain(|index, _| *index < keep);
        }
        Ok(())
    }

    fn list_cases(&self) -> Result<Vec<String>> {
        Ok(self.lock().keys().cloned().collect())
    }

    fn read_manifest(&self, case: &str) -> Result<Option<CaseManifest>> {
        Ok(self.lock().get(case).and_then(|c| c.manifest.clone()))
    }

    fn write_manifest(&self, case: &str, manifest: &CaseManifest) -> Result<()> {
        self.lock().entry(case.to_string()).or_default().manifest = Some(manifest.clone());
        Ok(())
    }

    fn location(&self, case: &str) -> String {
        format!("memory://{}", case)
    }
}
