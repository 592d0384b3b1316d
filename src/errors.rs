//! Typed error hierarchy for the soak orchestrator.
//!
//! Three top-level enums cover the three failure surfaces:
//! - `ConfigError`: invalid run configuration, rejected before any work starts
//! - `StageError`: per-stage failures, always recovered at the cycle level
//! - `StoreError`: artifact and checkpoint persistence failures

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Fatal configuration errors. A run never starts with one of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {message}")]
    ParseFailed {
        path: std::path::PathBuf,
        message: String,
    },

    #[error("Invalid value for '{field}': {message}")]
    InvalidField { field: &'static str, message: String },

    #[error("No stages configured; at least one [[stages]] entry is required")]
    NoStages,

    #[error("Stage '{name}' is configured more than once")]
    DuplicateStage { name: String },
}

/// Classification of a cycle failure, preserved in `CycleResult` and counted
/// in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Recoverable,
    Validation,
    Timeout,
    Dependency,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Recoverable => "recoverable",
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Dependency => "dependency",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from a single stage invocation.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Stage {stage} failed: {message}")]
    Recoverable { stage: String, message: String },

    #[error("Stage {stage} returned invalid output: {reason}")]
    Validation { stage: String, reason: String },

    #[error("Cycle attempt timed out after {}s", .elapsed.as_secs_f64())]
    Timeout { elapsed: Duration },

    #[error("Stage {stage} could not reach dependency {component}: {message}")]
    DependencyUnavailable {
        stage: String,
        component: String,
        message: String,
    },
}

impl StageError {
    pub fn recoverable(stage: &str, message: impl Into<String>) -> Self {
        StageError::Recoverable {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    pub fn validation(stage: &str, reason: impl Into<String>) -> Self {
        StageError::Validation {
            stage: stage.to_string(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Recoverable { .. } => ErrorKind::Recoverable,
            StageError::Validation { .. } => ErrorKind::Validation,
            StageError::Timeout { .. } => ErrorKind::Timeout,
            StageError::DependencyUnavailable { .. } => ErrorKind::Dependency,
        }
    }

    /// Name of the dependency a stage reported as unreachable, if any.
    pub fn dependency(&self) -> Option<&str> {
        match self {
            StageError::DependencyUnavailable { component, .. } => Some(component),
            _ => None,
        }
    }
}

/// Errors from the artifact and checkpoint stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to write {path}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Run directory {path} is locked by another soak process")]
    Locked { path: std::path::PathBuf },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_kinds_are_distinct() {
        let errs = [
            StageError::recoverable("audit", "boom"),
            StageError::validation("audit", "too short"),
            StageError::Timeout {
                elapsed: Duration::from_secs(5),
            },
            StageError::DependencyUnavailable {
                stage: "research".into(),
                component: "search".into(),
                message: "connection refused".into(),
            },
        ];
        let kinds: Vec<ErrorKind> = errs.iter().map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ErrorKind::Recoverable,
                ErrorKind::Validation,
                ErrorKind::Timeout,
                ErrorKind::Dependency
            ]
        );
    }

    #[test]
    fn dependency_error_exposes_component() {
        let err = StageError::DependencyUnavailable {
            stage: "research".into(),
            component: "search".into(),
            message: "503".into(),
        };
        assert_eq!(err.dependency(), Some("search"));
        assert!(StageError::recoverable("x", "y").dependency().is_none());
    }

    #[test]
    fn timeout_message_mentions_elapsed() {
        let err = StageError::Timeout {
            elapsed: Duration::from_millis(1500),
        };
        assert!(err.to_string().contains("1.5"));
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::Timeout).unwrap();
        assert_eq!(json, "\"timeout\"");
        assert_eq!(ErrorKind::Dependency.to_string(), "dependency");
    }

    #[test]
    fn config_error_carries_field_name() {
        let err = ConfigError::InvalidField {
            field: "cycles",
            message: "must be > 0".into(),
        };
        assert!(err.to_string().contains("cycles"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConfigError::NoStages);
        assert_std_error(&StageError::recoverable("a", "b"));
        assert_std_error(&StoreError::Locked {
            path: "/tmp/x".into(),
        });
    }
}
