//! C1: the durable, per-plan record of progress (spec ss4.1).
//!
//! One self-contained JSON file per plan, named `<plan_id>.json`. Writes
//! go through a temp-file-then-rename so a concurrent reader never
//! observes a partially written file -- it sees either the previous state
//! or the new one, never a half-write.

use std::path::{Path, PathBuf};

use crate::domain::PlanState;
use crate::errors::OrchestratorError;

const STATE_EXTENSION: &str = "json";

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open (creating if necessary) the directory that holds plan state
    /// files. Fails with `StorageUnavailable` if the directory can't be
    /// created or isn't writable.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, OrchestratorError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| OrchestratorError::StorageUnavailable(format!("{}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path_for(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.{STATE_EXTENSION}"))
    }

    /// Load the persisted state for `plan_id`, or `None` if it has never
    /// been run.
    pub fn load(&self, plan_id: &str) -> Result<Option<PlanState>, OrchestratorError> {
        let path = self.path_for(plan_id);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let state: PlanState = serde_json::from_str(&contents).map_err(|e| {
                    OrchestratorError::StorageUnavailable(format!(
                        "corrupt state file {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OrchestratorError::StorageUnavailable(format!(
                "{}: {e}",
                path.display()
            ))),
        }
    }

    /// Atomically replace the persisted state for `plan_id`.
    ///
    /// Writes to a sibling temp file in the same directory (so the
    /// rename is same-filesystem, hence atomic) and renames it over the
    /// final path.
    pub fn save(&self, plan_id: &str, state: &PlanState) -> Result<(), OrchestratorError> {
        let path = self.path_for(plan_id);
        let json = serde_json::to_string_pretty(state).map_err(|e| {
            OrchestratorError::StorageUnavailable(format!("failed to serialize state: {e}"))
        })?;

        let tmp_path = self.dir.join(format!(".{plan_id}.{STATE_EXTENSION}.tmp"));
        std::fs::write(&tmp_path, json).map_err(|e| {
            OrchestratorError::StorageUnavailable(format!("{}: {e}", tmp_path.display()))
        })?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            OrchestratorError::StorageUnavailable(format!(
                "renaming {} to {}: {e}",
                tmp_path.display(),
                path.display()
            ))
        })?;
        Ok(())
    }

    /// Enumerate every plan id with persisted state, for history/cost
    /// commands.
    pub fn list(&self) -> Result<Vec<String>, OrchestratorError> {
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(&self.dir).map_err(|e| {
            OrchestratorError::StorageUnavailable(format!("{}: {e}", self.dir.display()))
        })?;
        for entry in entries {
            let entry = entry.map_err(|e| OrchestratorError::StorageUnavailable(e.to_string()))?;
            let path: PathBuf = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(STATE_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if !stem.starts_with('.') {
                        ids.push(stem.to_string());
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Derive `plan_id` from a plan document's path, per spec ss3.
pub fn plan_id_for(path: &Path) -> String {
    crate::domain::plan_id_from_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_state() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        let state = PlanState::new("demo", "/plans/demo.md");
        store.save("demo", &state).unwrap();

        let loaded = store.load("demo").unwrap().expect("state should exist");
        assert_eq!(loaded.plan_id, "demo");
        assert_eq!(loaded.completed_tasks, Vec::<String>::new());
    }

    #[test]
    fn load_missing_plan_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        assert!(store.load("nonexistent").unwrap().is_none());
    }

    #[test]
    fn save_is_idempotent_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        let mut state = PlanState::new("demo", "/plans/demo.md");
        state.completed_tasks.push("1.1".to_string());

        store.save("demo", &state).unwrap();
        let first = store.load("demo").unwrap().unwrap();
        store.save("demo", &first).unwrap();
        let second = store.load("demo").unwrap().unwrap();

        assert_eq!(first.completed_tasks, second.completed_tasks);
    }

    #[test]
    fn list_enumerates_saved_plans() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        store
            .save("alpha", &PlanState::new("alpha", "/plans/alpha.md"))
            .unwrap();
        store
            .save("beta", &PlanState::new("beta", "/plans/beta.md"))
            .unwrap();

        assert_eq!(store.list().unwrap(), vec!["alpha".to_string(), "beta".to_string()]);
    }
}
