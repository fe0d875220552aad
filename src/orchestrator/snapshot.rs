//! Loop-run snapshot persistence.
//!
//! One JSON object keyed by project id, value = the full run record.
//! Written load-all/mutate-one/write-all with replace-whole-file semantics,
//! so a crash mid-write never leaves a torn snapshot behind. A process-wide
//! lock serializes the read-modify-write cycle across concurrently running
//! project engines. Sized for tens of projects, not high write rates.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::domain::LoopRun;
use crate::error::{ForemanError, Result};

/// File-backed store of loop-run snapshots.
#[derive(Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl SnapshotStore {
    /// Create a store writing to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// The snapshot file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every persisted run, keyed by project id.
    pub fn load_all(&self) -> Result<BTreeMap<String, LoopRun>> {
        let _guard = self.guard();
        self.read_map()
    }

    /// Load one project's run, if persisted.
    pub fn load(&self, project_id: &str) -> Result<Option<LoopRun>> {
        let _guard = self.guard();
        Ok(self.read_map()?.remove(project_id))
    }

    /// Insert or replace one project's run.
    pub fn save(&self, run: &LoopRun) -> Result<()> {
        let _guard = self.guard();
        let mut map = self.read_map()?;
        map.insert(run.project_id.clone(), run.clone());
        self.write_map(&map)
    }

    /// Remove one project's run. Removing an absent project is a no-op.
    pub fn remove(&self, project_id: &str) -> Result<()> {
        let _guard = self.guard();
        let mut map = self.read_map()?;
        if map.remove(project_id).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_map(&self) -> Result<BTreeMap<String, LoopRun>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let contents = fs::read_to_string(&self.path)?;
        serde_json::from_str(&contents)
            .map_err(|e| ForemanError::Storage(format!("unreadable snapshot file: {}", e)))
    }

    fn write_map(&self, map: &BTreeMap<String, LoopRun>) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| ForemanError::Storage(format!("snapshot path has no parent: {}", self.path.display())))?;
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut tmp, map)?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.path)
            .map_err(|e| ForemanError::Storage(format!("failed to persist snapshot: {}", e)))?;

        debug!("persisted {} run snapshot(s)", map.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LoopState, Ticket};
    use tempfile::TempDir;

    fn sample_run(project: &str) -> LoopRun {
        LoopRun::new(
            project,
            PathBuf::from("/tmp/work"),
            vec![Ticket::new("T-1", "Title", "Body")],
        )
    }

    fn test_store() -> (SnapshotStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = SnapshotStore::new(temp.path().join("loops.json"));
        (store, temp)
    }

    #[test]
    fn test_load_from_missing_file() {
        let (store, _temp) = test_store();
        assert!(store.load_all().unwrap().is_empty());
        assert!(store.load("nope").unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let (store, _temp) = test_store();
        let run = sample_run("proj-a");

        store.save(&run).unwrap();
        let loaded = store.load("proj-a").unwrap().unwrap();
        assert_eq!(loaded, run);
    }

    #[test]
    fn test_save_keys_by_project() {
        let (store, _temp) = test_store();
        store.save(&sample_run("proj-a")).unwrap();
        store.save(&sample_run("proj-b")).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("proj-a"));
        assert!(all.contains_key("proj-b"));
    }

    #[test]
    fn test_save_replaces_existing_run() {
        let (store, _temp) = test_store();
        let mut run = sample_run("proj-a");
        store.save(&run).unwrap();

        run.next_index = 1;
        run.completed_ticket_ids.push("T-1".into());
        store.save(&run).unwrap();

        let all = store.load_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["proj-a"].next_index, 1);
    }

    #[test]
    fn test_remove_run() {
        let (store, _temp) = test_store();
        store.save(&sample_run("proj-a")).unwrap();
        store.save(&sample_run("proj-b")).unwrap();

        store.remove("proj-a").unwrap();
        let all = store.load_all().unwrap();
        assert!(!all.contains_key("proj-a"));
        assert!(all.contains_key("proj-b"));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let (store, _temp) = test_store();
        store.remove("never-there").unwrap();
    }

    #[test]
    fn test_snapshot_survives_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("loops.json");
        let run = sample_run("proj-a");

        {
            let store = SnapshotStore::new(&path);
            store.save(&run).unwrap();
        }

        // A fresh store (fresh process) sees the same state
        let store = SnapshotStore::new(&path);
        let loaded = store.load("proj-a").unwrap().unwrap();
        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.state, LoopState::PreparingQueue);
    }

    #[test]
    fn test_corrupt_file_is_storage_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("loops.json");
        fs::write(&path, "{ torn write").unwrap();

        let store = SnapshotStore::new(&path);
        let err = store.load_all().unwrap_err();
        assert!(matches!(err, ForemanError::Storage(_)));
    }

    #[test]
    fn test_clones_share_the_file_lock() {
        let (store, _temp) = test_store();
        let clone = store.clone();
        assert!(Arc::ptr_eq(&store.lock, &clone.lock));
        assert_eq!(store.path(), clone.path());
    }
}
