//! Per-cycle artifact tree.
//!
//! ```text
//! <root>/cycle_001/
//!   profile.json
//!   attempt_1/01_interview.json  01_interview.txt  02_audit.json ...
//!   attempts.jsonl
//!   manifest.jsonl
//!   score.json
//!   result.json      (written last; marks the cycle as fully persisted)
//! ```
//!
//! Nothing under a cycle directory is rewritten. Re-running a cycle (after a
//! crash, or past the last checkpoint) first moves the previous directory
//! aside to `cycle_NNN.stale-<ts>`, which [`ArtifactStore::read_all`] ignores.

use super::{append_jsonl, read_jsonl, write_json_atomic};
use crate::cycle::{AttemptRecord, CycleResult};
use crate::errors::StoreError;
use crate::profile::Profile;
use crate::stage::StageOutput;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

pub const RESULT_FILE: &str = "result.json";
pub const ATTEMPTS_FILE: &str = "attempts.jsonl";
pub const MANIFEST_FILE: &str = "manifest.jsonl";
pub const PROFILE_FILE: &str = "profile.json";
pub const SCORE_FILE: &str = "score.json";

/// Content hash of one artifact file, relative to its cycle directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub file: String,
    pub sha256: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScoreFile {
    score: f64,
}

/// Everything persisted for one cycle.
#[derive(Debug, Clone)]
pub struct CycleRecord {
    pub index: u32,
    pub dir: PathBuf,
    /// `None` when the cycle never finished (partial artifacts only).
    pub result: Option<CycleResult>,
    pub attempts: Vec<AttemptRecord>,
    pub manifest: Vec<ManifestEntry>,
    pub score: Option<f64>,
}

impl CycleRecord {
    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }

    /// Files whose current content no longer matches the manifest.
    pub fn integrity_mismatches(&self) -> Vec<String> {
        self.manifest
            .iter()
            .filter(|entry| match fs::read(self.dir.join(&entry.file)) {
                Ok(bytes) => sha256_hex(&bytes) != entry.sha256,
                Err(_) => true,
            })
            .map(|entry| entry.file.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create artifact root {}", self.root.display()))
    }

    pub fn cycle_dir(&self, index: u32) -> PathBuf {
        self.root.join(format!("cycle_{:03}", index))
    }

    /// Prepare a fresh directory for `index`, moving any earlier one aside.
    pub fn begin_cycle(&self, index: u32, profile: &Profile) -> Result<PathBuf> {
        let dir = self.cycle_dir(index);
        if dir.exists() {
            let stale = self.root.join(format!(
                "cycle_{:03}.stale-{}",
                index,
                chrono::Utc::now().timestamp_millis()
            ));
            fs::rename(&dir, &stale).map_err(|source| StoreError::WriteFailed {
                path: stale.clone(),
                source,
            })?;
            tracing::warn!(cycle = index, stale = %stale.display(), "moved earlier cycle directory aside");
        }
        fs::create_dir_all(&dir).map_err(|source| StoreError::WriteFailed {
            path: dir.clone(),
            source,
        })?;
        self.write_file(index, PROFILE_FILE, &serde_json::to_vec_pretty(profile)?)?;
        Ok(dir)
    }

    /// Persist one stage's output in structured and plain-text form.
    pub fn save_stage(
        &self,
        index: u32,
        attempt: u32,
        position: usize,
        output: &StageOutput,
    ) -> Result<()> {
        let rel_dir = format!("attempt_{}", attempt);
        let abs_dir = self.cycle_dir(index).join(&rel_dir);
        fs::create_dir_all(&abs_dir).map_err(|source| StoreError::WriteFailed {
            path: abs_dir.clone(),
            source,
        })?;

        let stem = format!("{:02}_{}", position, sanitize(&output.stage));
        let json = serde_json::to_vec_pretty(output).map_err(|source| StoreError::Serialize {
            what: "stage output",
            source,
        })?;
        self.write_file(index, &format!("{}/{}.json", rel_dir, stem), &json)?;
        self.write_file(index, &format!("{}/{}.txt", rel_dir, stem), output.text.as_bytes())?;
        Ok(())
    }

    pub fn record_attempt(&self, index: u32, record: &AttemptRecord) -> Result<()> {
        append_jsonl(&self.cycle_dir(index).join(ATTEMPTS_FILE), record)
    }

    pub fn save_score(&self, index: u32, score: f64) -> Result<()> {
        let json = serde_json::to_vec_pretty(&ScoreFile { score })?;
        self.write_file(index, SCORE_FILE, &json)
    }

    /// Write the final result. After this the cycle counts as fully persisted.
    pub fn save_result(&self, result: &CycleResult) -> Result<()> {
        write_json_atomic(&self.cycle_dir(result.index).join(RESULT_FILE), result)
    }

    /// Whether the cycle's `result.json` is on disk.
    pub fn is_persisted(&self, index: u32) -> bool {
        self.cycle_dir(index).join(RESULT_FILE).exists()
    }

    /// Distinct cycles up to and including `through` that have a `result.json`.
    pub fn persisted_count(&self, through: u32) -> Result<usize> {
        let mut indices = self.cycle_indices()?;
        indices.dedup();
        Ok(indices
            .into_iter()
            .filter(|i| *i <= through && self.is_persisted(*i))
            .count())
    }

    /// All cycle directories in index order.
    pub fn read_all(&self) -> Result<impl Iterator<Item = CycleRecord> + '_> {
        let mut indices = self.cycle_indices()?;
        indices.dedup();
        Ok(indices.into_iter().map(move |index| self.read_cycle(index)))
    }

    pub fn read_cycle(&self, index: u32) -> CycleRecord {
        let dir = self.cycle_dir(index);
        let result = fs::read_to_string(dir.join(RESULT_FILE))
            .ok()
            .and_then(|c| serde_json::from_str::<CycleResult>(&c).ok());
        let score = fs::read_to_string(dir.join(SCORE_FILE))
            .ok()
            .and_then(|c| serde_json::from_str::<ScoreFile>(&c).ok())
            .map(|s| s.score);
        CycleRecord {
            index,
            attempts: read_jsonl(&dir.join(ATTEMPTS_FILE)).unwrap_or_default(),
            manifest: read_jsonl(&dir.join(MANIFEST_FILE)).unwrap_or_default(),
            result,
            score,
            dir,
        }
    }

    /// Indices of every `cycle_<digits>` directory, sorted. Two directories
    /// naming the same index (`cycle_7` and `cycle_007`) both appear.
    pub fn cycle_indices(&self) -> Result<Vec<u32>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut indices: Vec<u32> = walkdir::WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .filter_map(|e| parse_cycle_dir(&e.file_name().to_string_lossy()))
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    /// Write a new file under the cycle directory and record its hash.
    fn write_file(&self, index: u32, rel: &str, bytes: &[u8]) -> Result<()> {
        let dir = self.cycle_dir(index);
        let path = dir.join(rel);
        fs::write(&path, bytes).map_err(|source| StoreError::WriteFailed {
            path: path.clone(),
            source,
        })?;
        append_jsonl(
            &dir.join(MANIFEST_FILE),
            &ManifestEntry {
                file: rel.to_string(),
                sha256: sha256_hex(bytes),
                bytes: bytes.len(),
            },
        )
    }
}

fn parse_cycle_dir(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("cycle_")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::profile::ProfileGenerator;
    use std::time::Duration;
    use tempfile::tempdir;

    fn profile(i: u32) -> Profile {
        ProfileGenerator::new(5).profile_for(i)
    }

    #[test]
    fn test_cycle_dir_is_zero_padded() {
        let store = ArtifactStore::new(Path::new("/runs"));
        assert_eq!(store.cycle_dir(7), PathBuf::from("/runs/cycle_007"));
        assert_eq!(store.cycle_dir(1234), PathBuf::from("/runs/cycle_1234"));
    }

    #[test]
    fn test_save_stage_writes_both_forms() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.begin_cycle(1, &profile(1)).unwrap();
        let output = StageOutput::text("interview", "answers here")
            .with_structured(serde_json::json!({"answers": 3}));
        store.save_stage(1, 1, 1, &output).unwrap();

        let base = dir.path().join("cycle_001/attempt_1");
        assert_eq!(
            fs::read_to_string(base.join("01_interview.txt")).unwrap(),
            "answers here"
        );
        let json: StageOutput =
            serde_json::from_str(&fs::read_to_string(base.join("01_interview.json")).unwrap())
                .unwrap();
        assert_eq!(json, output);
    }

    #[test]
    fn test_read_all_orders_and_skips_stale() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        for i in [3, 1, 2] {
            store.begin_cycle(i, &profile(i)).unwrap();
            store
                .save_result(&CycleResult::success(i, vec![], None, 1, Duration::ZERO))
                .unwrap();
        }
        // restart cycle 2: old directory is moved aside
        store.begin_cycle(2, &profile(2)).unwrap();

        let records: Vec<CycleRecord> = store.read_all().unwrap().collect();
        let indices: Vec<u32> = records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert!(records[0].is_complete());
        assert!(!records[1].is_complete());
        assert!(!store.is_persisted(2));
        assert_eq!(store.persisted_count(3).unwrap(), 2);
        assert_eq!(store.persisted_count(1).unwrap(), 1);

        let stale_count = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".stale-"))
            .count();
        assert_eq!(stale_count, 1);
    }

    #[test]
    fn test_attempts_and_score_round_trip() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.begin_cycle(4, &profile(4)).unwrap();
        for attempt in 1..=2 {
            store
                .record_attempt(
                    4,
                    &AttemptRecord {
                        attempt,
                        started_at: chrono::Utc::now(),
                        duration: Duration::from_millis(10),
                        success: attempt == 2,
                        stages_completed: vec![],
                        error_kind: (attempt == 1).then_some(ErrorKind::Timeout),
                        error: None,
                    },
                )
                .unwrap();
        }
        store.save_score(4, 6.5).unwrap();

        let record = store.read_cycle(4);
        assert_eq!(record.attempts.len(), 2);
        assert_eq!(record.attempts[0].error_kind, Some(ErrorKind::Timeout));
        assert_eq!(record.score, Some(6.5));
    }

    #[test]
    fn test_manifest_detects_tampering() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        store.begin_cycle(1, &profile(1)).unwrap();
        store
            .save_stage(1, 1, 1, &StageOutput::text("audit", "original"))
            .unwrap();
        assert!(store.read_cycle(1).integrity_mismatches().is_empty());

        fs::write(dir.path().join("cycle_001/attempt_1/01_audit.txt"), "edited").unwrap();
        assert_eq!(
            store.read_cycle(1).integrity_mismatches(),
            vec!["attempt_1/01_audit.txt".to_string()]
        );
    }

    #[test]
    fn test_parse_cycle_dir() {
        assert_eq!(parse_cycle_dir("cycle_001"), Some(1));
        assert_eq!(parse_cycle_dir("cycle_120"), Some(120));
        assert_eq!(parse_cycle_dir("cycle_001.stale-123"), None);
        assert_eq!(parse_cycle_dir("cycle_"), None);
        assert_eq!(parse_cycle_dir("checkpoint.json"), None);
    }

    #[test]
    fn test_read_all_on_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(&dir.path().join("missing"));
        assert_eq!(store.read_all().unwrap().count(), 0);
    }
}
