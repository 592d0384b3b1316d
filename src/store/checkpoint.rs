use super::write_json_atomic;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Durable record of the last fully completed cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_completed_cycle: u32,
    pub timestamp: DateTime<Utc>,
    pub results_count: usize,
    /// Run that wrote the checkpoint. Absent in hand-written files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

impl Checkpoint {
    pub fn new(last_completed_cycle: u32, results_count: usize, run_id: Option<Uuid>) -> Self {
        Self {
            last_completed_cycle,
            timestamp: Utc::now(),
            results_count,
            run_id,
        }
    }

    /// First cycle a resumed run should execute. Saturates for hand-edited
    /// checkpoints at `u32::MAX`.
    pub fn next_cycle(&self) -> u32 {
        self.last_completed_cycle.saturating_add(1)
    }
}

pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            path: run_dir.join(CHECKPOINT_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the checkpoint atomically.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        write_json_atomic(&self.path, checkpoint)?;
        tracing::debug!(
            last_completed_cycle = checkpoint.last_completed_cycle,
            results_count = checkpoint.results_count,
            "checkpoint written"
        );
        Ok(())
    }

    /// Best-effort read. Missing or corrupt files mean "start from cycle 1".
    pub fn load(&self) -> Option<Checkpoint> {
        if !self.path.exists() {
            return None;
        }
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "checkpoint unreadable, starting from cycle 1");
                return None;
            }
        };
        match serde_json::from_str::<Checkpoint>(&content) {
            Ok(cp) => Some(cp),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "checkpoint corrupt, starting from cycle 1");
                None
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempdir().unwrap();
        assert!(CheckpointStore::new(dir.path()).load().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let run_id = Uuid::new_v4();
        store.save(&Checkpoint::new(4, 4, Some(run_id))).unwrap();

        let cp = store.load().unwrap();
        assert_eq!(cp.last_completed_cycle, 4);
        assert_eq!(cp.results_count, 4);
        assert_eq!(cp.run_id, Some(run_id));
        assert_eq!(cp.next_cycle(), 5);
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&Checkpoint::new(2, 2, None)).unwrap();
        store.save(&Checkpoint::new(6, 6, None)).unwrap();
        assert_eq!(store.load().unwrap().last_completed_cycle, 6);
    }

    #[test]
    fn test_corrupt_checkpoint_is_none() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        fs::write(store.path(), "{\"last_completed_cycle\": 3, \"times").unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn test_hand_written_checkpoint_without_run_id() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        fs::write(
            store.path(),
            r#"{"last_completed_cycle": 7, "timestamp": "2026-01-01T00:00:00Z", "results_count": 7}"#,
        )
        .unwrap();
        let cp = store.load().unwrap();
        assert_eq!(cp.next_cycle(), 8);
        assert!(cp.run_id.is_none());
    }

    #[test]
    fn test_next_cycle_saturates_at_max() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        fs::write(
            store.path(),
            r#"{"last_completed_cycle": 4294967295, "timestamp": "2026-01-01T00:00:00Z", "results_count": 0}"#,
        )
        .unwrap();
        assert_eq!(store.load().unwrap().next_cycle(), u32::MAX);
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(&Checkpoint::new(1, 1, None)).unwrap();
        store.clear().unwrap();
        assert!(store.load().is_none());
    }
}
