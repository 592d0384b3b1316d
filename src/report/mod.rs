//! Morning report: everything an operator needs from a run directory,
//! rebuilt from the artifact tree alone.

mod markdown;

use crate::cycle::result::duration_serde;
use crate::errors::ErrorKind;
use crate::health::{Component, HEALTH_LOG_FILE, HealthStatus};
use crate::orchestrator::RunMetadata;
use crate::repair::{REPAIR_LOG_FILE, RepairLog, RepairStats};
use crate::store::{ArtifactStore, CheckpointStore, read_jsonl, write_atomic};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub const REPORT_MARKDOWN_FILE: &str = "report.md";
pub const REPORT_JSON_FILE: &str = "report.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreStats {
    pub count: u32,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

/// How far attempts got through each stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageAttempts {
    /// Attempts in which the stage completed.
    pub completed: u32,
    /// Attempts that ended (failed) while this stage was next.
    pub failed_at: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedCycle {
    pub cycle: u32,
    pub kind: Option<ErrorKind>,
    pub attempts: u32,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub run_id: Option<Uuid>,
    pub planned_cycles: Option<u32>,
    pub last_checkpoint: Option<u32>,
    /// Cycle directories with a final result.
    pub completed: u32,
    pub successful: u32,
    pub failed: u32,
    /// Cycle directories without `result.json` (interrupted mid-cycle).
    pub incomplete: Vec<u32>,
    pub success_rate: f64,
    #[serde(with = "duration_serde")]
    pub mean_cycle_duration: Duration,
    pub scores: Option<ScoreStats>,
    pub error_kinds: BTreeMap<ErrorKind, u32>,
    pub total_attempts: u32,
    pub retried_cycles: u32,
    pub stage_attempts: BTreeMap<String, StageAttempts>,
    pub failures: Vec<FailedCycle>,
    pub repairs: RepairStats,
    pub unhealthy_ticks: BTreeMap<Component, u32>,
    /// `cycle_NNN/<file>` entries whose content no longer matches the manifest.
    pub integrity_mismatches: Vec<String>,
    /// Indices below the highest cycle seen that have no directory.
    pub missing_cycles: Vec<u32>,
    /// Indices with more than one directory.
    pub duplicate_cycles: Vec<u32>,
}

impl RunReport {
    /// Harness problems are separated from pipeline problems in the summary.
    pub fn harness_was_flaky(&self) -> bool {
        self.repairs.total > 0 || self.unhealthy_ticks.values().any(|n| *n > 0)
    }

    pub fn render_markdown(&self) -> String {
        markdown::render(self)
    }

    /// Write `report.md` and `report.json` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<()> {
        write_atomic(&dir.join(REPORT_MARKDOWN_FILE), self.render_markdown().as_bytes())?;
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize report")?;
        write_atomic(&dir.join(REPORT_JSON_FILE), &json)
    }
}

/// Reads a run directory and computes a [`RunReport`].
pub struct ReportAggregator {
    root: PathBuf,
}

impl ReportAggregator {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn build(&self) -> Result<RunReport> {
        if !self.root.is_dir() {
            anyhow::bail!("{} is not a run directory", self.root.display());
        }
        let store = ArtifactStore::new(&self.root);
        let metadata = RunMetadata::load(&self.root);
        let checkpoint = CheckpointStore::new(&self.root).load();

        let mut completed = 0;
        let mut successful = 0;
        let mut incomplete = Vec::new();
        let mut total_duration = Duration::ZERO;
        let mut scores = Vec::new();
        let mut error_kinds = BTreeMap::new();
        let mut total_attempts = 0;
        let mut retried_cycles = 0;
        let mut stage_attempts: BTreeMap<String, StageAttempts> = BTreeMap::new();
        let mut failures = Vec::new();
        let mut integrity_mismatches = Vec::new();

        let stage_order = metadata.as_ref().map(|m| m.stages.clone()).unwrap_or_default();

        for record in store.read_all()? {
            total_attempts += record.attempts.len() as u32;
            if record.attempts.len() > 1 {
                retried_cycles += 1;
            }
            for attempt in &record.attempts {
                for stage in &attempt.stages_completed {
                    stage_attempts.entry(stage.clone()).or_default().completed += 1;
                }
                if !attempt.success
                    && let Some(next) = stage_order.get(attempt.stages_completed.len())
                {
                    stage_attempts.entry(next.clone()).or_default().failed_at += 1;
                }
            }
            for file in record.integrity_mismatches() {
                integrity_mismatches.push(format!("cycle_{:03}/{}", record.index, file));
            }

            let Some(result) = &record.result else {
                incomplete.push(record.index);
                continue;
            };
            completed += 1;
            total_duration += result.duration;
            if let Some(score) = record.score.or(result.score) {
                scores.push(score);
            }
            if result.success {
                successful += 1;
            } else {
                if let Some(kind) = result.error_kind {
                    *error_kinds.entry(kind).or_insert(0) += 1;
                }
                failures.push(FailedCycle {
                    cycle: result.index,
                    kind: result.error_kind,
                    attempts: result.attempts,
                    error: result.error.clone().unwrap_or_default(),
                });
            }
        }

        let (missing_cycles, duplicate_cycles) = index_anomalies(&store.cycle_indices()?);

        let repairs = RepairLog::read(&self.root.join(REPAIR_LOG_FILE))
            .map(|records| RepairStats::from_records(&records))
            .unwrap_or_default();

        let mut unhealthy_ticks = BTreeMap::new();
        let health: Vec<HealthStatus> =
            read_jsonl(&self.root.join(HEALTH_LOG_FILE)).unwrap_or_default();
        for status in health.iter().filter(|s| !s.healthy) {
            *unhealthy_ticks.entry(status.component).or_insert(0) += 1;
        }

        Ok(RunReport {
            generated_at: Utc::now(),
            run_id: metadata.as_ref().map(|m| m.run_id),
            planned_cycles: metadata.as_ref().map(|m| m.cycles),
            last_checkpoint: checkpoint.map(|c| c.last_completed_cycle),
            completed,
            successful,
            failed: completed - successful,
            incomplete,
            success_rate: if completed == 0 {
                0.0
            } else {
                successful as f64 / completed as f64
            },
            mean_cycle_duration: if completed == 0 {
                Duration::ZERO
            } else {
                total_duration / completed
            },
            scores: score_stats(&scores),
            error_kinds,
            total_attempts,
            retried_cycles,
            stage_attempts,
            failures,
            repairs,
            unhealthy_ticks,
            integrity_mismatches,
            missing_cycles,
            duplicate_cycles,
        })
    }
}

fn score_stats(scores: &[f64]) -> Option<ScoreStats> {
    if scores.is_empty() {
        return None;
    }
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(ScoreStats {
        count: scores.len() as u32,
        min,
        mean: scores.iter().sum::<f64>() / scores.len() as f64,
        max,
    })
}

/// (gaps, duplicates) over sorted directory indices.
fn index_anomalies(sorted: &[u32]) -> (Vec<u32>, Vec<u32>) {
    let Some(&max) = sorted.last() else {
        return (Vec::new(), Vec::new());
    };
    let missing = (1..=max).filter(|i| sorted.binary_search(i).is_err()).collect();
    let mut duplicates: Vec<u32> = sorted
        .windows(2)
        .filter(|w| w[0] == w[1])
        .map(|w| w[0])
        .collect();
    duplicates.dedup();
    (missing, duplicates)
}
