//! Persisted worker state: revoked task ids and per-task execution
//! counters. Flat JSON file, loaded at startup and synced periodically
//! and at shutdown, mirroring the schedule persistence in
//! `foreman-beat`.

use foreman_registry::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to write state file {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("failed to decode state file {path}: {source}")]
    Decode { path: PathBuf, source: serde_json::Error },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskCounters {
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub revoked: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    revoked: HashSet<TaskId>,
    counters: HashMap<String, TaskCounters>,
}

/// Worker-local state that survives a restart: which task ids have been
/// revoked, and running success/failure/retry counts per task name.
/// Revocation is consulted by the pool before a slot claims a task;
/// counters are informational only and never gate behavior.
pub struct WorkerState {
    path: PathBuf,
    inner: RwLock<PersistedState>,
}

impl WorkerState {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, StateError> {
        let path = path.into();
        let inner = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|source| StateError::Read {
                path: path.clone(),
                source,
            })?;
            serde_json::from_slice(&bytes).map_err(|source| StateError::Decode {
                path: path.clone(),
                source,
            })?
        } else {
            PersistedState::default()
        };

        Ok(Self { path, inner: RwLock::new(inner) })
    }

    pub fn revoke(&self, task_id: TaskId) {
        let mut inner = self.inner.write().unwrap();
        inner.revoked.insert(task_id);
    }

    pub fn is_revoked(&self, task_id: &TaskId) -> bool {
        self.inner.read().unwrap().revoked.contains(task_id)
    }

    /// Every task id revoked in a prior run, for seeding the pool's
    /// in-memory revocation set at startup.
    pub fn revoked_ids(&self) -> Vec<TaskId> {
        self.inner.read().unwrap().revoked.iter().copied().collect()
    }

    pub fn record_succeeded(&self, task_name: &str) {
        self.inner.write().unwrap().counters.entry(task_name.to_string()).or_default().succeeded += 1;
    }

    pub fn record_failed(&self, task_name: &str) {
        self.inner.write().unwrap().counters.entry(task_name.to_string()).or_default().failed += 1;
    }

    pub fn record_retried(&self, task_name: &str) {
        self.inner.write().unwrap().counters.entry(task_name.to_string()).or_default().retried += 1;
    }

    pub fn record_revoked(&self, task_name: &str) {
        self.inner.write().unwrap().counters.entry(task_name.to_string()).or_default().revoked += 1;
    }

    pub fn counters(&self, task_name: &str) -> TaskCounters {
        self.inner.read().unwrap().counters.get(task_name).cloned().unwrap_or_default()
    }

    pub fn sync(&self) -> Result<(), StateError> {
        let inner = self.inner.read().unwrap();
        let bytes = serde_json::to_vec_pretty(&*inner).expect("PersistedState always serializes");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        std::fs::write(&self.path, bytes).map_err(|source| StateError::Write {
            path: self.path.clone(),
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl foreman_registry::TaskCounterSink for WorkerState {
    fn record_succeeded(&self, task_name: &str) {
        WorkerState::record_succeeded(self, task_name);
    }

    fn record_failed(&self, task_name: &str) {
        WorkerState::record_failed(self, task_name);
    }

    fn record_retried(&self, task_name: &str) {
        WorkerState::record_retried(self, task_name);
    }

    fn record_revoked(&self, task_name: &str) {
        WorkerState::record_revoked(self, task_name);
    }
}

/// Drop revoked ids and counters for tasks no longer in the registry,
/// called alongside the beat schedule's own cleanup pass.
pub fn cleanup(state: &WorkerState, known_names: &[String]) {
    let mut inner = state.inner.write().unwrap();
    let before = inner.counters.len();
    inner.counters.retain(|name, _| known_names.contains(name));
    let removed = before - inner.counters.len();
    if removed > 0 {
        warn!(removed, "pruned stale task counters with no registry counterpart");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = WorkerState::load(dir.path().join("state.json")).unwrap();
        assert!(!state.is_revoked(&TaskId::new_v4()));
    }

    #[test]
    fn revocation_and_counters_round_trip_through_sync() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let id = TaskId::new_v4();

        {
            let state = WorkerState::load(&path).unwrap();
            state.revoke(id);
            state.record_succeeded("add");
            state.record_succeeded("add");
            state.sync().unwrap();
        }

        let reloaded = WorkerState::load(&path).unwrap();
        assert!(reloaded.is_revoked(&id));
        assert_eq!(reloaded.counters("add").succeeded, 2);
    }

    #[test]
    fn cleanup_drops_unregistered_task_counters() {
        let dir = tempfile::tempdir().unwrap();
        let state = WorkerState::load(dir.path().join("state.json")).unwrap();
        state.record_succeeded("kept");
        state.record_succeeded("stale");

        cleanup(&state, &["kept".to_string()]);
        assert_eq!(state.counters("kept").succeeded, 1);
        assert_eq!(state.counters("stale").succeeded, 0);
    }
}
