//! Run configuration loaded from `soak.toml`.
//!
//! Every table rejects unknown keys so a typo never silently falls back to a
//! default for an overnight run.
//!
//! # Configuration File Format
//!
//! ```toml
//! [run]
//! cycles = 100
//! parallelism = 1
//! timeout_per_cycle_secs = 900
//! max_retries = 3
//! checkpoint_interval = 5
//! max_duration_secs = 28800
//! artifact_dir = "runs/nightly"
//! substitute_search_provider = false
//! retry_delay_secs = 5
//! seed = 42
//!
//! [[stages]]
//! name = "interview"
//! command = "./pipeline/interview.sh"
//! required_fields = ["answers"]
//! min_chars = 200
//!
//! [health]
//! interval_secs = 10
//!
//! [dependencies.database]
//! path = "runs/nightly/results.db"
//!
//! [dependencies.search]
//! url = "https://search.example.com"
//! probe_path = "/health"
//! substitute_url = "http://localhost:8089"
//!
//! [dependencies.remote_shell]
//! host = "gpu-box"
//! required_packages = ["numpy"]
//!
//! [notify]
//! command = "notify-send \"$SOAK_URGENCY\" \"$SOAK_MESSAGE\""
//! ```

use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Immutable run parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub cycles: u32,
    #[serde(default = "default_parallelism")]
    pub parallelism: u32,
    pub timeout_per_cycle_secs: u64,
    /// Total attempts per cycle (0 is treated as a single attempt).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,
    pub max_duration_secs: u64,
    pub artifact_dir: PathBuf,
    #[serde(default)]
    pub substitute_search_provider: bool,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    /// Profile seed; a random seed is drawn and persisted when absent.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(skip)]
    cycle_timeout: Option<Duration>,
    #[serde(skip)]
    retry_delay: Option<Duration>,
}

fn default_parallelism() -> u32 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_checkpoint_interval() -> u32 {
    1
}

fn default_retry_delay_secs() -> u64 {
    5
}

impl RunConfig {
    /// A minimal config rooted at `artifact_dir`, mostly for tests and demos.
    pub fn new(cycles: u32, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            cycles,
            parallelism: default_parallelism(),
            timeout_per_cycle_secs: 300,
            max_retries: default_max_retries(),
            checkpoint_interval: default_checkpoint_interval(),
            max_duration_secs: 8 * 3600,
            artifact_dir: artifact_dir.into(),
            substitute_search_provider: false,
            retry_delay_secs: default_retry_delay_secs(),
            seed: None,
            cycle_timeout: None,
            retry_delay: None,
        }
    }

    /// Replace `timeout_per_cycle_secs` with a finer-grained timeout. Only
    /// settable from code; files carry whole seconds.
    pub fn set_cycle_timeout(&mut self, timeout: Duration) {
        self.cycle_timeout = Some(timeout);
    }

    /// Replace `retry_delay_secs`, as with [`RunConfig::set_cycle_timeout`].
    pub fn set_retry_delay(&mut self, delay: Duration) {
        self.retry_delay = Some(delay);
    }

    pub fn timeout_per_cycle(&self) -> Duration {
        self.cycle_timeout
            .unwrap_or_else(|| Duration::from_secs(self.timeout_per_cycle_secs))
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
            .unwrap_or_else(|| Duration::from_secs(self.retry_delay_secs))
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    /// Number of attempts a cycle gets before it is recorded as failed.
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::InvalidField {
                    field,
                    message: "must be greater than 0".into(),
                });
            }
            Ok(())
        }

        positive("cycles", self.cycles.into())?;
        positive("parallelism", self.parallelism.into())?;
        positive("checkpoint_interval", self.checkpoint_interval.into())?;
        positive("max_duration_secs", self.max_duration_secs)?;
        if self.timeout_per_cycle().is_zero() {
            return Err(ConfigError::InvalidField {
                field: "timeout_per_cycle_secs",
                message: "must be greater than 0".into(),
            });
        }
        if self.checkpoint_interval > self.cycles {
            return Err(ConfigError::InvalidField {
                field: "checkpoint_interval",
                message: format!(
                    "{} exceeds the total cycle count {}",
                    self.checkpoint_interval, self.cycles
                ),
            });
        }
        if self.artifact_dir.as_os_str().is_empty() {
            return Err(ConfigError::InvalidField {
                field: "artifact_dir",
                message: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// One pipeline stage, executed as an external command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    pub command: String,
    /// Top-level fields the structured output must carry.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Minimum length of the plain-text output.
    #[serde(default)]
    pub min_chars: usize,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_check_timeout_secs")]
    pub check_timeout_secs: u64,
    #[serde(default = "default_min_free_disk_mb")]
    pub min_free_disk_mb: u64,
    #[serde(default = "default_min_available_memory_mb")]
    pub min_available_memory_mb: u64,
    #[serde(skip)]
    interval: Option<Duration>,
}

fn default_interval_secs() -> u64 {
    10
}

fn default_check_timeout_secs() -> u64 {
    5
}

fn default_min_free_disk_mb() -> u64 {
    1024
}

fn default_min_available_memory_mb() -> u64 {
    256
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            check_timeout_secs: default_check_timeout_secs(),
            min_free_disk_mb: default_min_free_disk_mb(),
            min_available_memory_mb: default_min_available_memory_mb(),
            interval: None,
        }
    }
}

impl HealthConfig {
    /// Tick faster than `interval_secs` allows.
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = Some(interval);
    }

    pub fn interval(&self) -> Duration {
        self.interval
            .unwrap_or_else(|| Duration::from_secs(self.interval_secs))
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

/// An HTTP dependency (LLM-style API, vector index).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpEndpointConfig {
    pub url: String,
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    /// Environment variable holding the API key, sent as a bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_probe_path() -> String {
    "/".to_string()
}

/// The search dependency, with an optional named substitute provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchConfig {
    pub url: String,
    #[serde(default = "default_probe_path")]
    pub probe_path: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Used only when `run.substitute_search_provider` is set.
    #[serde(default)]
    pub substitute_url: Option<String>,
}

impl SearchConfig {
    pub fn primary(&self) -> HttpEndpointConfig {
        HttpEndpointConfig {
            url: self.url.clone(),
            probe_path: self.probe_path.clone(),
            api_key_env: self.api_key_env.clone(),
        }
    }

    pub fn substitute(&self) -> Option<HttpEndpointConfig> {
        self.substitute_url.as_ref().map(|url| HttpEndpointConfig {
            url: url.clone(),
            probe_path: self.probe_path.clone(),
            api_key_env: None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteShellConfig {
    pub host: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub required_packages: Vec<String>,
    #[serde(default = "default_list_command")]
    pub list_command: String,
    /// `{package}` is replaced with the package name.
    #[serde(default = "default_install_command")]
    pub install_command: String,
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_list_command() -> String {
    "python3 -m pip list --format=freeze".to_string()
}

fn default_install_command() -> String {
    "python3 -m pip install --quiet {package}".to_string()
}

/// External dependencies the driven pipeline needs. All optional; disk and
/// memory are always monitored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependenciesConfig {
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub llm_api: Option<HttpEndpointConfig>,
    #[serde(default)]
    pub search: Option<SearchConfig>,
    #[serde(default)]
    pub vector_index: Option<HttpEndpointConfig>,
    #[serde(default)]
    pub remote_shell: Option<RemoteShellConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// The whole `soak.toml` document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SoakToml {
    pub run: RunConfig,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub dependencies: DependenciesConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// CLI-level overrides applied on top of the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub cycles: Option<u32>,
    pub artifact_dir: Option<PathBuf>,
}

impl SoakToml {
    /// Load, apply overrides and validate. Nothing is partially applied: any
    /// error leaves the caller with no config.
    pub fn load(path: &Path, overrides: &Overrides) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&content).map_err(|e| match e {
            ConfigError::ParseFailed { message, .. } => ConfigError::ParseFailed {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        config.apply(overrides);

        // Relative artifact dirs resolve against the config file's directory.
        if config.run.artifact_dir.is_relative()
            && let Some(parent) = path.parent()
        {
            config.run.artifact_dir = parent.join(&config.run.artifact_dir);
        }

        config.validate()?;
        Ok(config)
    }

    /// Parse without validation.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseFailed {
            path: PathBuf::new(),
            message: e.to_string(),
        })
    }

    pub fn apply(&mut self, overrides: &Overrides) {
        if let Some(cycles) = overrides.cycles {
            self.run.cycles = cycles;
            if self.run.checkpoint_interval > cycles {
                self.run.checkpoint_interval = cycles.max(1);
            }
        }
        if let Some(dir) = &overrides.artifact_dir {
            self.run.artifact_dir = dir.clone();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.run.validate()?;

        if self.stages.is_empty() {
            return Err(ConfigError::NoStages);
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(ConfigError::InvalidField {
                    field: "stages.name",
                    message: "must not be empty".into(),
                });
            }
            if stage.command.trim().is_empty() {
                return Err(ConfigError::InvalidField {
                    field: "stages.command",
                    message: format!("stage '{}' has an empty command", stage.name),
                });
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(ConfigError::DuplicateStage {
                    name: stage.name.clone(),
                });
            }
        }

        if self.health.interval().is_zero() {
            return Err(ConfigError::InvalidField {
                field: "health.interval_secs",
                message: "must be greater than 0".into(),
            });
        }
        if self.health.check_timeout_secs == 0 {
            return Err(ConfigError::InvalidField {
                field: "health.check_timeout_secs",
                message: "must be greater than 0".into(),
            });
        }

        if self.run.substitute_search_provider {
            let has_substitute = self
                .dependencies
                .search
                .as_ref()
                .is_some_and(|s| s.substitute_url.is_some());
            if !has_substitute {
                return Err(ConfigError::InvalidField {
                    field: "substitute_search_provider",
                    message: "requires [dependencies.search] substitute_url".into(),
                });
            }
        }

        if let Some(remote) = &self.dependencies.remote_shell
            && !remote.install_command.contains("{package}")
        {
            return Err(ConfigError::InvalidField {
                field: "dependencies.remote_shell.install_command",
                message: "must contain the {package} placeholder".into(),
            });
        }

        Ok(())
    }

    /// Render a starter config.
    pub fn template() -> &'static str {
        r#"[run]
cycles = 20
parallelism = 1
timeout_per_cycle_secs = 900
max_retries = 3
checkpoint_interval = 5
max_duration_secs = 28800
artifact_dir = "runs/nightly"
substitute_search_provider = false

[[stages]]
name = "interview"
command = "./pipeline/interview.sh"
min_chars = 200

[[stages]]
name = "audit"
command = "./pipeline/audit.sh"

[[stages]]
name = "research"
command = "./pipeline/research.sh"

[[stages]]
name = "write"
command = "./pipeline/write.sh"
min_chars = 1000

[[stages]]
name = "review"
command = "./pipeline/review.sh"
required_fields = ["verdict"]

[health]
interval_secs = 10
"#
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const MINIMAL: &str = r#"
[run]
cycles = 10
timeout_per_cycle_secs = 60
checkpoint_interval = 2
max_duration_secs = 3600
artifact_dir = "out"

[[stages]]
name = "interview"
command = "echo hi"
"#;

    #[test]
    fn test_parse_minimal_applies_defaults() {
        let config = SoakToml::parse(MINIMAL).unwrap();
        assert_eq!(config.run.cycles, 10);
        assert_eq!(config.run.parallelism, 1);
        assert_eq!(config.run.max_retries, 3);
        assert_eq!(config.run.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.health.interval(), Duration::from_secs(10));
        assert!(config.dependencies.database.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let content = MINIMAL.replace("cycles = 10", "cycles = 10\nturbo = true");
        let err = SoakToml::parse(&content).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed { .. }));
        assert!(err.to_string().contains("turbo"));
    }

    #[test]
    fn test_sub_second_overrides_are_code_only() {
        let content = MINIMAL.replace("cycles = 10", "cycles = 10\nretry_delay_ms = 0");
        assert!(SoakToml::parse(&content).is_err());

        let mut config = SoakToml::parse(MINIMAL).unwrap();
        config.run.set_retry_delay(Duration::ZERO);
        config.run.set_cycle_timeout(Duration::from_millis(250));
        config.health.set_interval(Duration::from_millis(20));
        assert_eq!(config.run.retry_delay(), Duration::ZERO);
        assert_eq!(config.run.timeout_per_cycle(), Duration::from_millis(250));
        assert_eq!(config.health.interval(), Duration::from_millis(20));

        let shown = toml::to_string_pretty(&config).unwrap();
        assert!(!shown.contains("retry_delay_ms"));
        assert!(shown.contains("retry_delay_secs = 5"));
    }

    #[test]
    fn test_unknown_table_is_rejected() {
        let content = format!("{}\n[metrics]\nenabled = true\n", MINIMAL);
        assert!(SoakToml::parse(&content).is_err());
    }

    #[test]
    fn test_zero_cycles_is_invalid() {
        let mut config = SoakToml::parse(MINIMAL).unwrap();
        config.run.cycles = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { field: "cycles", .. }));
    }

    #[test]
    fn test_checkpoint_interval_above_cycles_is_invalid() {
        let mut config = SoakToml::parse(MINIMAL).unwrap();
        config.run.checkpoint_interval = 11;
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidField {
                field: "checkpoint_interval",
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_stage_is_invalid() {
        let content = format!(
            "{}\n[[stages]]\nname = \"interview\"\ncommand = \"echo again\"\n",
            MINIMAL
        );
        let config = SoakToml::parse(&content).unwrap();
        assert!(matches!(
            config.validate().unwrap_err(),
            ConfigError::DuplicateStage { .. }
        ));
    }

    #[test]
    fn test_missing_stages_is_invalid() {
        let content = MINIMAL.split("[[stages]]").next().unwrap();
        let config = SoakToml::parse(content).unwrap();
        assert!(matches!(config.validate().unwrap_err(), ConfigError::NoStages));
    }

    #[test]
    fn test_substitute_flag_requires_substitute_url() {
        let content = MINIMAL.replace(
            "artifact_dir = \"out\"",
            "artifact_dir = \"out\"\nsubstitute_search_provider = true",
        );
        let config = SoakToml::parse(&content).unwrap();
        assert!(config.validate().is_err());

        let with_search = format!(
            "{}\n[dependencies.search]\nurl = \"http://a\"\nsubstitute_url = \"http://b\"\n",
            content
        );
        let config = SoakToml::parse(&with_search).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_load_resolves_relative_artifact_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("soak.toml");
        fs::write(&path, MINIMAL).unwrap();
        let config = SoakToml::load(&path, &Overrides::default()).unwrap();
        assert_eq!(config.run.artifact_dir, dir.path().join("out"));
    }

    #[test]
    fn test_overrides_clamp_checkpoint_interval() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("soak.toml");
        fs::write(&path, MINIMAL).unwrap();
        let overrides = Overrides {
            cycles: Some(1),
            artifact_dir: Some(dir.path().join("elsewhere")),
        };
        let config = SoakToml::load(&path, &overrides).unwrap();
        assert_eq!(config.run.cycles, 1);
        assert_eq!(config.run.checkpoint_interval, 1);
        assert_eq!(config.run.artifact_dir, dir.path().join("elsewhere"));
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let err = SoakToml::load(Path::new("/nonexistent/soak.toml"), &Overrides::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::ReadFailed { .. }));
    }

    #[test]
    fn test_attempt_budget_treats_zero_as_one() {
        let mut run = RunConfig::new(3, "out");
        run.max_retries = 0;
        assert_eq!(run.attempt_budget(), 1);
        run.max_retries = 2;
        assert_eq!(run.attempt_budget(), 2);
    }

    #[test]
    fn test_template_is_valid() {
        let config = SoakToml::parse(SoakToml::template()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.stages.len(), 5);
    }

    #[test]
    fn test_install_command_requires_placeholder() {
        let content = format!(
            "{}\n[dependencies.remote_shell]\nhost = \"box\"\ninstall_command = \"pip install\"\n",
            MINIMAL
        );
        let config = SoakToml::parse(&content).unwrap();
        assert!(config.validate().is_err());
    }
}
