use crate::cycle::result::duration_serde;
use crate::health::Component;
use crate::store::{append_jsonl, read_jsonl};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const REPAIR_LOG_FILE: &str = "repair_log.jsonl";

/// One repair attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairRecord {
    pub timestamp: DateTime<Utc>,
    pub component: Component,
    pub strategy: String,
    pub success: bool,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Sub-actions taken, in order.
    #[serde(default)]
    pub actions: Vec<String>,
}

/// Append-only repair history, in memory and in `repair_log.jsonl`.
#[derive(Clone, Default)]
pub struct RepairLog {
    records: Arc<Mutex<Vec<RepairRecord>>>,
    path: Option<PathBuf>,
}

impl RepairLog {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_file(path: PathBuf) -> Self {
        Self {
            records: Arc::default(),
            path: Some(path),
        }
    }

    /// Read a run's full history from disk.
    pub fn read(path: &Path) -> Result<Vec<RepairRecord>> {
        read_jsonl(path)
    }

    pub fn append(&self, record: RepairRecord) {
        if let Some(path) = &self.path
            && let Err(e) = append_jsonl(path, &record)
        {
            tracing::warn!(error = %format!("{:#}", e), "failed to append repair log");
        }
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    pub fn records(&self) -> Vec<RepairRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RepairStats {
        RepairStats::from_records(&self.records())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentRepairStats {
    pub attempts: u32,
    pub successes: u32,
    pub success_rate: f64,
    pub mean_duration_ms: f64,
}

/// Repair outcomes grouped by component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairStats {
    pub total: u32,
    pub successes: u32,
    pub by_component: BTreeMap<Component, ComponentRepairStats>,
}

impl RepairStats {
    pub fn from_records(records: &[RepairRecord]) -> Self {
        let mut grouped: BTreeMap<Component, Vec<&RepairRecord>> = BTreeMap::new();
        for record in records {
            grouped.entry(record.component).or_default().push(record);
        }

        let by_component = grouped
            .into_iter()
            .map(|(component, records)| {
                let attempts = records.len() as u32;
                let successes = records.iter().filter(|r| r.success).count() as u32;
                let total_ms: f64 = records.iter().map(|r| r.duration.as_secs_f64() * 1000.0).sum();
                (
                    component,
                    ComponentRepairStats {
                        attempts,
                        successes,
                        success_rate: successes as f64 / attempts as f64,
                        mean_duration_ms: total_ms / attempts as f64,
                    },
                )
            })
            .collect();

        Self {
            total: records.len() as u32,
            successes: records.iter().filter(|r| r.success).count() as u32,
            by_component,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(component: Component, success: bool, ms: u64) -> RepairRecord {
        RepairRecord {
            timestamp: Utc::now(),
            component,
            strategy: "test".into(),
            success,
            duration: Duration::from_millis(ms),
            error: (!success).then(|| "nope".to_string()),
            actions: vec![],
        }
    }

    #[test]
    fn test_stats_group_by_component() {
        let stats = RepairStats::from_records(&[
            record(Component::Database, false, 100),
            record(Component::Database, true, 300),
            record(Component::Disk, false, 10),
        ]);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.successes, 1);
        let db = &stats.by_component[&Component::Database];
        assert_eq!(db.attempts, 2);
        assert_eq!(db.successes, 1);
        assert!((db.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((db.mean_duration_ms - 200.0).abs() < 1e-6);
        assert_eq!(stats.by_component[&Component::Disk].successes, 0);
    }

    #[test]
    fn test_log_persists_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(REPAIR_LOG_FILE);
        let log = RepairLog::with_file(path.clone());
        log.append(record(Component::Search, true, 5));
        log.append(record(Component::Search, false, 5));

        assert_eq!(log.len(), 2);
        let on_disk = RepairLog::read(&path).unwrap();
        assert_eq!(on_disk, log.records());
    }
}
