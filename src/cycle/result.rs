//! Per-cycle outcome types.

use crate::errors::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Final outcome of one cycle. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    /// 1-based cycle index, unique within a run.
    pub index: u32,
    pub success: bool,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stages that produced output in the final attempt, in order.
    pub stages: Vec<String>,
    /// Evaluator score from the final attempt (0 to 10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub attempts: u32,
    pub artifact_saved: bool,
    pub finished_at: DateTime<Utc>,
}

impl CycleResult {
    pub fn success(
        index: u32,
        stages: Vec<String>,
        score: Option<f64>,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self {
            index,
            success: true,
            duration,
            stages,
            score,
            error: None,
            error_kind: None,
            attempts,
            artifact_saved: true,
            finished_at: Utc::now(),
        }
    }

    /// A cycle that exhausted its attempts. `error` is the last error verbatim.
    pub fn failure(
        index: u32,
        stages: Vec<String>,
        error: String,
        kind: ErrorKind,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self {
            index,
            success: false,
            duration,
            stages,
            score: None,
            error: Some(error),
            error_kind: Some(kind),
            attempts,
            artifact_saved: true,
            finished_at: Utc::now(),
        }
    }

    pub fn with_artifact_saved(mut self, saved: bool) -> Self {
        self.artifact_saved = saved;
        self
    }
}

/// One line of `attempts.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    pub success: bool,
    /// Stages that completed before the attempt ended.
    pub stages_completed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Serde helpers for Duration serialization (milliseconds).
pub mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
