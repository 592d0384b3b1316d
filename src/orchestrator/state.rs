//! Run-level records: `run.json` metadata and the end-of-run summary.

use crate::cycle::CycleResult;
use crate::cycle::result::duration_serde;
use crate::errors::ErrorKind;
use crate::repair::RepairStats;
use crate::store::write_json_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub const RUN_FILE: &str = "run.json";
pub const SUMMARY_FILE: &str = "summary.json";

/// Identity of a run, kept stable across resumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    /// One entry per resume.
    #[serde(default)]
    pub resumed_at: Vec<DateTime<Utc>>,
    pub cycles: u32,
    pub stages: Vec<String>,
}

impl RunMetadata {
    pub fn new(seed: u64, cycles: u32, stages: Vec<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            seed,
            started_at: Utc::now(),
            resumed_at: Vec::new(),
            cycles,
            stages,
        }
    }

    /// `None` when missing or unreadable.
    pub fn load(run_dir: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(run_dir.join(RUN_FILE)).ok()?;
        match serde_json::from_str(&content) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable run.json");
                None
            }
        }
    }

    pub fn save(&self, run_dir: &Path) -> Result<()> {
        write_json_atomic(&run_dir.join(RUN_FILE), self).context("Failed to write run.json")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    BudgetExhausted,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::BudgetExhausted => "budget_exhausted",
            StopReason::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one orchestrator process did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub total_cycles: u32,
    pub start_cycle: u32,
    /// Cycles run by this process.
    pub attempted: u32,
    pub successful: u32,
    pub failed: u32,
    pub stop_reason: StopReason,
    pub last_checkpoint: u32,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// `successful / attempted`, 0 when nothing ran.
    pub success_rate: f64,
    #[serde(with = "duration_serde")]
    pub mean_cycle_duration: Duration,
    /// Mean evaluator score over the cycles that produced one.
    #[serde(default)]
    pub mean_score: Option<f64>,
    pub artifact_dir: PathBuf,
    pub error_kinds: BTreeMap<ErrorKind, u32>,
    pub repairs: RepairStats,
    pub results: Vec<CycleResult>,
}

impl RunSummary {
    #[allow(clippy::too_many_arguments)]
    pub fn from_results(
        run_id: Uuid,
        total_cycles: u32,
        start_cycle: u32,
        results: Vec<CycleResult>,
        stop_reason: StopReason,
        last_checkpoint: u32,
        duration: Duration,
        repairs: RepairStats,
        artifact_dir: PathBuf,
    ) -> Self {
        let attempted = results.len() as u32;
        let successful = results.iter().filter(|r| r.success).count() as u32;
        let mut error_kinds = BTreeMap::new();
        for kind in results.iter().filter_map(|r| r.error_kind) {
            *error_kinds.entry(kind).or_insert(0) += 1;
        }
        let scores: Vec<f64> = results.iter().filter_map(|r| r.score).collect();
        Self {
            run_id,
            total_cycles,
            start_cycle,
            attempted,
            successful,
            failed: attempted - successful,
            stop_reason,
            last_checkpoint,
            duration,
            success_rate: if attempted == 0 {
                0.0
            } else {
                successful as f64 / attempted as f64
            },
            mean_cycle_duration: if attempted == 0 {
                Duration::ZERO
            } else {
                results.iter().map(|r| r.duration).sum::<Duration>() / attempted
            },
            mean_score: if scores.is_empty() {
                None
            } else {
                Some(scores.iter().sum::<f64>() / scores.len() as f64)
            },
            artifact_dir,
            error_kinds,
            repairs,
            results,
        }
    }

    pub fn save(&self, run_dir: &Path) -> Result<()> {
        write_json_atomic(&run_dir.join(SUMMARY_FILE), self).context("Failed to write summary.json")
    }

    pub fn load(run_dir: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(run_dir.join(SUMMARY_FILE)).ok()?;
        serde_json::from_str(&content).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_summary_counts_and_kinds() {
        let secs = Duration::from_secs;
        let results = vec![
            CycleResult::success(1, vec![], Some(8.0), 1, secs(4)),
            CycleResult::success(2, vec![], Some(6.0), 1, secs(2)),
            CycleResult::failure(3, vec![], "t".into(), ErrorKind::Timeout, 2, secs(1)),
            CycleResult::failure(4, vec![], "v".into(), ErrorKind::Validation, 2, secs(1)),
        ];
        let summary = RunSummary::from_results(
            Uuid::new_v4(),
            10,
            1,
            results,
            StopReason::BudgetExhausted,
            4,
            secs(9),
            RepairStats::default(),
            PathBuf::from("/tmp/soak-run"),
        );
        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.successful + summary.failed, summary.attempted);
        assert_eq!(summary.error_kinds[&ErrorKind::Timeout], 1);
        assert_eq!(summary.error_kinds[&ErrorKind::Validation], 1);
        assert!((summary.success_rate - 0.5).abs() < 1e-9);
        assert_eq!(summary.mean_cycle_duration, secs(2));
        assert_eq!(summary.mean_score, Some(7.0));
        assert_eq!(summary.artifact_dir, PathBuf::from("/tmp/soak-run"));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["stop_reason"], "budget_exhausted");
        assert_eq!(json["error_kinds"]["timeout"], 1);
        assert_eq!(json["artifact_dir"], "/tmp/soak-run");
    }

    #[test]
    fn test_summary_of_zero_cycles() {
        let summary = RunSummary::from_results(
            Uuid::new_v4(),
            3,
            4,
            vec![],
            StopReason::Completed,
            3,
            Duration::ZERO,
            RepairStats::default(),
            PathBuf::from("run"),
        );
        assert_eq!(summary.attempted, 0);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.mean_cycle_duration, Duration::ZERO);
        assert!(summary.mean_score.is_none());
    }

    #[test]
    fn test_run_metadata_round_trip_and_corruption() {
        let dir = tempdir().unwrap();
        assert!(RunMetadata::load(dir.path()).is_none());

        let meta = RunMetadata::new(42, 10, vec!["interview".into()]);
        meta.save(dir.path()).unwrap();
        assert_eq!(RunMetadata::load(dir.path()).unwrap(), meta);

        std::fs::write(dir.path().join(RUN_FILE), "{ nope").unwrap();
        assert!(RunMetadata::load(dir.path()).is_none());
    }
}
