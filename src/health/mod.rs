//! Dependency health: status types, per-component checks and the polling
//! monitor that hands unhealthy components to the repair controller.

pub mod checks;
pub mod monitor;

pub use checks::{HealthCheck, build_checks};
pub use monitor::{HealthMonitor, MonitorHandle};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const HEALTH_LOG_FILE: &str = "health_log.jsonl";

/// A monitored dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Database,
    LlmApi,
    Search,
    VectorIndex,
    RemoteShell,
    RemotePackages,
    Disk,
    Memory,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Database => "database",
            Component::LlmApi => "llm_api",
            Component::Search => "search",
            Component::VectorIndex => "vector_index",
            Component::RemoteShell => "remote_shell",
            Component::RemotePackages => "remote_packages",
            Component::Disk => "disk",
            Component::Memory => "memory",
        }
    }

    /// Local resources have no automatic remedy.
    pub fn is_local_resource(&self) -> bool {
        matches!(self, Component::Disk | Component::Memory)
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Component {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "database" | "db" => Ok(Component::Database),
            "llm_api" | "llm" | "api" => Ok(Component::LlmApi),
            "search" => Ok(Component::Search),
            "vector_index" | "vector" => Ok(Component::VectorIndex),
            "remote_shell" | "ssh" => Ok(Component::RemoteShell),
            "remote_packages" | "packages" => Ok(Component::RemotePackages),
            "disk" => Ok(Component::Disk),
            "memory" => Ok(Component::Memory),
            other => Err(format!("unknown component '{}'", other)),
        }
    }
}

/// Result of one check of one component. Replaced on every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub component: Component,
    pub healthy: bool,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    pub fn healthy(component: Component) -> Self {
        Self {
            component,
            healthy: true,
            metrics: BTreeMap::new(),
            error: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(component: Component, error: impl Into<String>) -> Self {
        Self {
            component,
            healthy: false,
            metrics: BTreeMap::new(),
            error: Some(error.into()),
            checked_at: Utc::now(),
        }
    }

    pub fn with_metric(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metrics.insert(key.to_string(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_round_trips_through_str() {
        for c in [
            Component::Database,
            Component::LlmApi,
            Component::Search,
            Component::VectorIndex,
            Component::RemoteShell,
            Component::RemotePackages,
            Component::Disk,
            Component::Memory,
        ] {
            assert_eq!(c.as_str().parse::<Component>().unwrap(), c);
        }
        assert!("gpu".parse::<Component>().is_err());
    }

    #[test]
    fn test_status_serializes_component_snake_case() {
        let status = HealthStatus::unhealthy(Component::RemotePackages, "numpy missing")
            .with_metric("missing", vec!["numpy"]);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["component"], "remote_packages");
        assert_eq!(json["healthy"], false);
        assert_eq!(json["metrics"]["missing"][0], "numpy");
    }
}
