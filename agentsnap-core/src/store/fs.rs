//! Filesystem snapshot store

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{
    ACTUAL_PREFIX, EVENTS_FILE, MANIFEST_FILE, REQUEST_FILE, RESPONSE_FILE, SnapshotStore,
    TOOL_CALLS_FILE, loop_entry_name, parse_loop_index,
};
use crate::error::{Result, SnapshotError};
use crate::record::{CaseManifest, LoopRecord, RecordedResponse};

/// Store keeping each case in a directory under a base directory
#[derive(Debug, Clone)]
pub struct FsSnapshotStore {
    base_dir: PathBuf,
}

impl FsSnapshotStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn case_dir(&self, case: &str) -> PathBuf {
        self.base_dir.join(case)
    }

    pub fn loop_dir(&self, case: &str, loop_index: usize) -> PathBuf {
        self.case_dir(case).join(loop_entry_name(loop_index))
    }

    /// Directory receiving the live capture of a loop.
    ///
    /// A loop past the end of the fixture has no canonical directory; its
    /// capture goes to `actual-loop-N/` so it is never counted as a loop.
    pub fn actual_dir(&self, case: &str, loop_index: usize) -> PathBuf {
        let dir = self.loop_dir(case, loop_index);
        if dir.join(REQUEST_FILE).is_file() {
            dir
        } else {
            self.case_dir(case)
                .join(format!("{}{}", ACTUAL_PREFIX, loop_entry_name(loop_index)))
        }
    }

    /// Loop directories of a case keyed by index
    fn scan(&self, case: &str) -> Result<BTreeMap<usize, PathBuf>> {
        let case_dir = self.case_dir(case);
        let mut loops = BTreeMap::new();
        if !case_dir.is_dir() {
            return Ok(loops);
        }

        for entry in fs::read_dir(&case_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(index) = entry.file_name().to_str().and_then(parse_loop_index) {
                loops.insert(index, path);
            }
        }
        Ok(loops)
    }
}

fn is_actual_name(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|name| name.starts_with(ACTUAL_PREFIX))
}

/// Remove `actual-*` files directly under `dir`
fn remove_actual_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if is_actual_name(&entry.file_name()) && entry.path().is_file() {
            fs::remove_file(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map(Some).map_err(|e| {
        SnapshotError::CorruptSnapshot(format!("failed to parse {}: {}", path.display(), e))
    })
}

impl SnapshotStore for FsSnapshotStore {
    fn case_exists(&self, case: &str) -> Result<bool> {
        Ok(self.case_dir(case).is_dir())
    }

    fn loop_indices(&self, case: &str) -> Result<Vec<usize>> {
        Ok(self.scan(case)?.into_keys().collect())
    }

    fn read(&self, case: &str, loop_index: usize) -> Result<LoopRecord> {
        let dir = self.loop_dir(case, loop_index);
        if !dir.is_dir() {
            return Err(SnapshotError::SnapshotNotFound {
                case: case.to_string(),
                location: dir.display().to_string(),
            });
        }

        let request: Value = read_json(&dir.join(REQUEST_FILE))?.ok_or_else(|| {
            SnapshotError::IncompleteLoop {
                loop_index,
                missing: REQUEST_FILE.to_string(),
            }
        })?;
        let response: RecordedResponse = read_json(&dir.join(RESPONSE_FILE))?.ok_or_else(|| {
            SnapshotError::IncompleteLoop {
                loop_index,
                missing: RESPONSE_FILE.to_string(),
            }
        })?;
        let events: Vec<Value> = read_json(&dir.join(EVENTS_FILE))?.unwrap_or_default();
        let tool_calls: Vec<Value> = read_json(&dir.join(TOOL_CALLS_FILE))?.unwrap_or_default();

        Ok(LoopRecord {
            loop_index,
            request,
            response,
            events,
            tool_calls,
        })
    }

    fn write(&self, case: &str, record: &LoopRecord) -> Result<()> {
        let dir = self.loop_dir(case, record.loop_index);
        fs::create_dir_all(&dir)?;

        write_json(&dir.join(REQUEST_FILE), &record.request)?;
        write_json(&dir.join(RESPONSE_FILE), &record.response)?;
        write_json(&dir.join(EVENTS_FILE), &record.events)?;
        write_json(&dir.join(TOOL_CALLS_FILE), &record.tool_calls)?;

        tracing::debug!(
            case = %case,
            loop_index = record.loop_index,
            path = %dir.display(),
            "Wrote loop record"
        );
        Ok(())
    }

    fn write_actual(&self, case: &str, record: &LoopRecord) -> Result<()> {
        let dir = self.actual_dir(case, record.loop_index);
        fs::create_dir_all(&dir)?;

        let actual = |name: &str| dir.join(format!("{}{}", ACTUAL_PREFIX, name));
        write_json(&actual(REQUEST_FILE), &record.request)?;
        write_json(&actual(RESPONSE_FILE), &record.response)?;
        write_json(&actual(EVENTS_FILE), &record.events)?;
        write_json(&actual(TOOL_CALLS_FILE), &record.tool_calls)?;

        tracing::info!(
            case = %case,
            loop_index = record.loop_index,
            path = %dir.display(),
            "Wrote actual artifacts for diffing"
        );
        Ok(())
    }

    fn cleanup_transient(&self, case: &str) -> Result<usize> {
        let case_dir = self.case_dir(case);
        if !case_dir.is_dir() {
            return Ok(0);
        }

        let mut removed = 0;
        for (_, dir) in self.scan(case)? {
            removed += remove_actual_files(&dir)?;
        }
        for entry in fs::read_dir(&case_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && is_actual_name(&entry.file_name()) {
                removed += remove_actual_files(&path)?;
                fs::remove_dir_all(&path)?;
            }
        }

        if removed > 0 {
            tracing::debug!(case = %case, removed = removed, "Removed transient artifacts");
        }
        Ok(removed)
    }

    fn clear_case(&self, case: &str) -> Result<()> {
        let dir = self.case_dir(case);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            tracing::info!(case = %case, path = %dir.display(), "Cleared snapshot case");
        }
        Ok(())
    }

    fn truncate(&self, case: &str, keep: usize) -> Result<()> {
        for (index, dir) in self.scan(case)? {
            if index >= keep {
                fs::remove_dir_all(&dir)?;
                tracing::debug!(case = %case, loop_index = index, "Removed surplus loop");
            }
        }
        Ok(())
    }

    fn list_cases(&self) -> Result<Vec<String>> {
        if !self.base_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut cases = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if entry.path().is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                cases.push(name.to_string());
            }
        }
        cases.sort();
        Ok(cases)
    }

    fn read_manifest(&self, case: &str) -> Result<Option<CaseManifest>> {
        read_json(&self.case_dir(case).join(MANIFEST_FILE))
    }

    fn write_manifest(&self, case: &str, manifest: &CaseManifest) -> Result<()> {
        let dir = self.case_dir(case);
        fs::create_dir_all(&dir)?;
        write_json(&dir.join(MANIFEST_FILE), manifest)
    }

    fn location(&self, case: &str) -> String {
        self.case_dir(case).display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::RunMode;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(loop_index: usize) -> LoopRecord {
        let mut record = LoopRecord::new(
            loop_index,
            json!({"model": "m", "messages": [{"role": "user", "content": format!("turn {}", loop_index)}]}),
            RecordedResponse::Message(json!({"content": "ok"})),
        );
        record.events = vec![json!({"sequence": 0, "event": {"type": "turn_started"}})];
        record.tool_calls = vec![json!({"tool_name": "lookup"})];
        record
    }

    #[test]
    fn test_write_then_read() {
        let temp = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp.path());

        assert!(!store.case_exists("weather").unwrap());
        store.write("weather", &record(0)).unwrap();
        assert!(store.case_exists("weather").unwrap());

        let loaded = store.read("weather", 0).unwrap();
        assert_eq!(loaded, record(0));

        let raw = fs::read_to_string(store.loop_dir("weather", 0).join(REQUEST_FILE)).unwrap();
        assert!(raw.contains("\n  "), "artifacts are pretty-printed");
    }

    #[test]
    fn test_numeric_loop_ordering() {
        let temp = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp.path());
        for i in 0..=10 {
            store.write("ordered", &record(i)).unwrap();
        }
        // Non-matching entries are ignored
        fs::create_dir_all(store.case_dir("ordered").join("notes")).unwrap();
        fs::create_dir_all(store.case_dir("ordered").join("loop-01")).unwrap();
        fs::write(store.case_dir("ordered").join("loop-11"), "not a directory").unwrap();

        assert_eq!(store.count("ordered").unwrap(), 11);
        assert_eq!(store.loop_indices("ordered").unwrap(), (0..=10).collect::<Vec<_>>());

        let all = store.read_all("ordered").unwrap();
        assert_eq!(all.last().unwrap().loop_index, 10);
        assert_eq!(all[9].request["messages"][0]["content"], "turn 9");
    }

    #[test]
    fn test_zero_loops_is_not_missing() {
        let temp = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp.path());
        fs::create_dir_all(store.case_dir("empty")).unwrap();

        assert!(store.case_exists("empty").unwrap());
        assert_eq!(store.count("empty").unwrap(), 0);
        assert_eq!(store.count("absent").unwrap(), 0);
        assert!(!store.case_exists("absent").unwrap());
    }

    #[test]
    fn test_partial_write_is_incomplete() {
        let temp = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp.path());
        store.write("partial", &record(0)).unwrap();
        fs::remove_file(store.loop_dir("partial", 0).join(RESPONSE_FILE)).unwrap();

        let err = store.read("partial", 0).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::IncompleteLoop { loop_index: 0, ref missing } if missing == RESPONSE_FILE
        ));
    }

    #[test]
    fn test_read_missing_loop() {
        let temp = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp.path());
        store.write("c", &record(0)).unwrap();
        assert!(matches!(
            store.read("c", 1),
            Err(SnapshotError::SnapshotNotFound { .. })
        ));
    }

    #[test]
    fn test_gap_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp.path());
        store.write("gap", &record(0)).unwrap();
        store.write("gap", &record(2)).unwrap();
        assert!(matches!(
            store.read_all("gap"),
            Err(SnapshotError::CorruptSnapshot(_))
        ));
    }

    #[test]
    fn test_actual_artifacts_cleanup() {
        let temp = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp.path());
        store.write("c", &record(0)).unwrap();
        store.write_actual("c", &record(0)).unwrap();
        store.write_actual("c", &record(1)).unwrap();

        assert!(store.loop_dir("c", 0).join("actual-request.json").is_file());
        assert!(store.case_dir("c").join("actual-loop-1/actual-request.json").is_file());
        assert!(!store.loop_dir("c", 1).exists());
        assert_eq!(store.count("c").unwrap(), 1);
        assert_eq!(store.read_all("c").unwrap().len(), 1);

        assert_eq!(store.cleanup_transient("c").unwrap(), 8);
        assert!(!store.loop_dir("c", 0).join("actual-request.json").exists());
        assert!(store.loop_dir("c", 0).join(REQUEST_FILE).is_file());
        assert!(!store.case_dir("c").join("actual-loop-1").exists());
        assert_eq!(store.count("c").unwrap(), 1);
        assert_eq!(store.cleanup_transient("absent").unwrap(), 0);
    }

    #[test]
    fn test_partial_loop_survives_cleanup() {
        let temp = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp.path());
        store.write("c", &record(0)).unwrap();
        fs::create_dir_all(store.loop_dir("c", 1)).unwrap();

        store.cleanup_transient("c").unwrap();
        assert_eq!(store.count("c").unwrap(), 2);
        assert!(matches!(
            store.read_all("c"),
            Err(SnapshotError::IncompleteLoop { loop_index: 1, .. })
        ));
    }

    #[test]
    fn test_truncate_and_clear() {
        let temp = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp.path());
        for i in 0..4 {
            store.write("c", &record(i)).unwrap();
        }
        store.truncate("c", 2).unwrap();
        assert_eq!(store.loop_indices("c").unwrap(), vec![0, 1]);

        store.clear_case("c").unwrap();
        assert!(!store.case_exists("c").unwrap());
        store.clear_case("c").unwrap();
    }

    #[test]
    fn test_manifest_and_listing() {
        let temp = TempDir::new().unwrap();
        let store = FsSnapshotStore::new(temp.path().join("snapshots"));
        assert!(store.list_cases().unwrap().is_empty());

        store.write("b_case", &record(0)).unwrap();
        store
            .write_manifest("a_case", &CaseManifest::new("a_case", 0, RunMode::Streaming))
            .unwrap();

        assert_eq!(store.list_cases().unwrap(), vec!["a_case", "b_case"]);
        let manifest = store.read_manifest("a_case").unwrap().unwrap();
        assert_eq!(manifest.mode, RunMode::Streaming);
        assert!(store.read_manifest("b_case").unwrap().is_none());
        assert!(store.location("a_case").ends_with("a_case"));
    }
}
