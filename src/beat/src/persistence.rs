//! Flat JSON file persistence for the schedule, standing in for the
//! original implementation's `shelve`-backed store (no direct Rust
//! analogue; a database is disproportionate to this component, see
//! DESIGN.md). Synced periodically and at clean shutdown, matching
//! `MockShelve`'s `sync()`/`close()` contract.

use crate::schedule::ScheduleEntry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to read schedule file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to write schedule file {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("failed to decode schedule file {path}: {source}")]
    Decode { path: PathBuf, source: serde_json::Error },
}

/// Owns the on-disk schedule file. `load` is tolerant of a missing file
/// (first run); a corrupt file is treated as an error rather than
/// silently discarded, since it may hold run-count history worth
/// preserving manually.
pub struct SchedulePersistence {
    path: PathBuf,
}

impl SchedulePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<HashMap<String, ScheduleEntry>, PersistenceError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = std::fs::read(&self.path).map_err(|source| PersistenceError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    pub fn sync(&self, schedule: &HashMap<String, ScheduleEntry>) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(schedule).expect("ScheduleEntry always serializes");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        std::fs::write(&self.path, bytes).map_err(|source| PersistenceError::Write {
            path: self.path.clone(),
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Remove entries whose task no longer has a Registry counterpart.
pub fn cleanup(schedule: &mut HashMap<String, ScheduleEntry>, known_names: &[String]) {
    let before = schedule.len();
    schedule.retain(|name, _| known_names.contains(name));
    let removed = before - schedule.len();
    if removed > 0 {
        warn!(removed, "pruned stale schedule entries with no registry counterpart");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchedulePersistence::new(dir.path().join("schedule.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn round_trips_through_sync_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchedulePersistence::new(dir.path().join("schedule.json"));
        let mut schedule = HashMap::new();
        schedule.insert("tick".to_string(), ScheduleEntry::new("tick", Duration::from_secs(30)));

        store.sync(&schedule).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded["tick"].name, "tick");
    }

    #[test]
    fn cleanup_removes_unregistered_entries() {
        let mut schedule = HashMap::new();
        schedule.insert("keep".to_string(), ScheduleEntry::new("keep", Duration::from_secs(1)));
        schedule.insert("stale".to_string(), ScheduleEntry::new("stale", Duration::from_secs(1)));

        cleanup(&mut schedule, &["keep".to_string()]);
        assert!(schedule.contains_key("keep"));
        assert!(!schedule.contains_key("stale"));
    }
}
