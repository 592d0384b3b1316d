use super::{Component, HealthStatus};
use crate::config::HealthConfig;
use crate::deps::{
    DatabaseDependency, Dependencies, DependencySlot, HttpEndpoint, RemoteDependency,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One dependency probe. Checks never fail: problems are reported as an
/// unhealthy [`HealthStatus`].
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn component(&self) -> Component;

    async fn check(&self) -> HealthStatus;
}

fn latency_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

pub struct DatabaseCheck {
    dep: DatabaseDependency,
}

#[async_trait]
impl HealthCheck for DatabaseCheck {
    fn component(&self) -> Component {
        Component::Database
    }

    async fn check(&self) -> HealthStatus {
        let Some(db) = self.dep.slot.current() else {
            return HealthStatus::unhealthy(Component::Database, "no open database handle");
        };
        match db.ping().await {
            Ok(latency) => {
                HealthStatus::healthy(Component::Database).with_metric("latency_ms", latency_ms(latency))
            }
            Err(e) => HealthStatus::unhealthy(Component::Database, format!("{:#}", e)),
        }
    }
}

/// Probe for API-style dependencies (`llm_api`, `search`, `vector_index`).
pub struct HttpCheck {
    component: Component,
    slot: DependencySlot<HttpEndpoint>,
}

impl HttpCheck {
    pub fn new(component: Component, slot: DependencySlot<HttpEndpoint>) -> Self {
        Self { component, slot }
    }
}

#[async_trait]
impl HealthCheck for HttpCheck {
    fn component(&self) -> Component {
        self.component
    }

    async fn check(&self) -> HealthStatus {
        let Some(endpoint) = self.slot.current() else {
            return HealthStatus::unhealthy(self.component, "no client installed");
        };

        let probe = match endpoint.probe().await {
            Ok(probe) => probe,
            Err(e) => return HealthStatus::unhealthy(self.component, format!("{:#}", e)),
        };

        let mut status = if probe.quota_exhausted() {
            HealthStatus::unhealthy(
                self.component,
                format!("quota exhausted (HTTP {})", probe.status),
            )
        } else if probe.is_success() {
            HealthStatus::healthy(self.component)
        } else {
            HealthStatus::unhealthy(
                self.component,
                format!("probe {} returned HTTP {}", endpoint.probe_url(), probe.status),
            )
        };

        status = status.with_metric("latency_ms", latency_ms(probe.latency));
        if let Some(remaining) = probe.remaining_quota {
            status = status.with_metric("remaining_quota", remaining);
        }
        if self.component == Component::Search {
            status = status.with_metric("substitute", endpoint.is_substitute());
        }
        status
    }
}

pub struct RemoteShellCheck {
    dep: RemoteDependency,
    timeout: Duration,
}

#[async_trait]
impl HealthCheck for RemoteShellCheck {
    fn component(&self) -> Component {
        Component::RemoteShell
    }

    async fn check(&self) -> HealthStatus {
        let Some(shell) = self.dep.slot.current() else {
            return HealthStatus::unhealthy(Component::RemoteShell, "no session parameters installed");
        };
        let start = Instant::now();
        match shell.exec("true", self.timeout).await {
            Ok(out) if out.success() => HealthStatus::healthy(Component::RemoteShell)
                .with_metric("latency_ms", latency_ms(start.elapsed())),
            Ok(out) => HealthStatus::unhealthy(
                Component::RemoteShell,
                format!(
                    "{} exited with {:?}: {}",
                    shell.destination(),
                    out.code,
                    out.stderr.trim()
                ),
            ),
            Err(e) => HealthStatus::unhealthy(Component::RemoteShell, format!("{:#}", e)),
        }
    }
}

pub struct RemotePackagesCheck {
    dep: RemoteDependency,
    timeout: Duration,
}

#[async_trait]
impl HealthCheck for RemotePackagesCheck {
    fn component(&self) -> Component {
        Component::RemotePackages
    }

    async fn check(&self) -> HealthStatus {
        let Some(shell) = self.dep.slot.current() else {
            return HealthStatus::unhealthy(Component::RemotePackages, "no session parameters installed");
        };
        let required = &self.dep.config.required_packages;
        match shell.exec(&self.dep.config.list_command, self.timeout).await {
            Ok(out) if out.success() => {
                let missing = missing_packages(&out.stdout, required);
                let status = if missing.is_empty() {
                    HealthStatus::healthy(Component::RemotePackages)
                } else {
                    HealthStatus::unhealthy(
                        Component::RemotePackages,
                        format!("missing packages: {}", missing.join(", ")),
                    )
                };
                status.with_metric("missing", missing)
            }
            Ok(out) => HealthStatus::unhealthy(
                Component::RemotePackages,
                format!("list command exited with {:?}: {}", out.code, out.stderr.trim()),
            ),
            Err(e) => HealthStatus::unhealthy(Component::RemotePackages, format!("{:#}", e)),
        }
    }
}

/// Free space on the filesystem holding the artifact directory.
pub struct DiskCheck {
    path: PathBuf,
    min_free_mb: u64,
}

impl DiskCheck {
    pub fn new(path: &Path, min_free_mb: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            min_free_mb,
        }
    }
}

#[async_trait]
impl HealthCheck for DiskCheck {
    fn component(&self) -> Component {
        Component::Disk
    }

    async fn check(&self) -> HealthStatus {
        // The artifact dir may not exist yet; measure its nearest ancestor.
        let Some(existing) = self.path.ancestors().find(|p| p.exists()) else {
            return HealthStatus::unhealthy(
                Component::Disk,
                format!("no existing ancestor of {}", self.path.display()),
            );
        };
        match fs2::available_space(existing) {
            Ok(bytes) => {
                let free_mb = bytes / (1024 * 1024);
                let status = if free_mb >= self.min_free_mb {
                    HealthStatus::healthy(Component::Disk)
                } else {
                    HealthStatus::unhealthy(
                        Component::Disk,
                        format!("{} MB free, need {} MB", free_mb, self.min_free_mb),
                    )
                };
                status.with_metric("free_mb", free_mb)
            }
            Err(e) => HealthStatus::unhealthy(
                Component::Disk,
                format!("statvfs {} failed: {}", existing.display(), e),
            ),
        }
    }
}

pub struct MemoryCheck {
    min_available_mb: u64,
}

impl MemoryCheck {
    pub fn new(min_available_mb: u64) -> Self {
        Self { min_available_mb }
    }
}

#[async_trait]
impl HealthCheck for MemoryCheck {
    fn component(&self) -> Component {
        Component::Memory
    }

    async fn check(&self) -> HealthStatus {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let available_mb = sys.available_memory() / (1024 * 1024);
        let status = if available_mb >= self.min_available_mb {
            HealthStatus::healthy(Component::Memory)
        } else {
            HealthStatus::unhealthy(
                Component::Memory,
                format!("{} MB available, need {} MB", available_mb, self.min_available_mb),
            )
        };
        status.with_metric("available_mb", available_mb)
    }
}

/// Required packages absent from a `name==version` (or `name version`) listing.
/// Names compare case-insensitively with `-` and `_` treated alike.
pub fn missing_packages(listing: &str, required: &[String]) -> Vec<String> {
    fn normalize(name: &str) -> String {
        name.trim().to_ascii_lowercase().replace('_', "-")
    }

    let installed: std::collections::HashSet<String> = listing
        .lines()
        .filter_map(|line| {
            let name = line
                .split(|c: char| c == '=' || c == '@' || c == '<' || c == '>' || c.is_whitespace())
                .next()?;
            (!name.is_empty()).then(|| normalize(name))
        })
        .collect();

    required
        .iter()
        .filter(|pkg| !installed.contains(&normalize(pkg)))
        .cloned()
        .collect()
}

/// Checks for every configured dependency plus the always-on local resources.
pub fn build_checks(
    deps: &Dependencies,
    health: &HealthConfig,
    artifact_dir: &Path,
) -> Vec<Arc<dyn HealthCheck>> {
    let mut checks: Vec<Arc<dyn HealthCheck>> = Vec::new();
    let timeout = health.check_timeout();

    if let Some(db) = &deps.database {
        checks.push(Arc::new(DatabaseCheck { dep: db.clone() }));
    }
    if let Some(api) = &deps.llm_api {
        checks.push(Arc::new(HttpCheck::new(Component::LlmApi, api.slot.clone())));
    }
    if let Some(search) = &deps.search {
        checks.push(Arc::new(HttpCheck::new(Component::Search, search.slot.clone())));
    }
    if let Some(index) = &deps.vector_index {
        checks.push(Arc::new(HttpCheck::new(Component::VectorIndex, index.slot.clone())));
    }
    if let Some(remote) = &deps.remote_shell {
        checks.push(Arc::new(RemoteShellCheck {
            dep: remote.clone(),
            timeout,
        }));
        if !remote.config.required_packages.is_empty() {
            checks.push(Arc::new(RemotePackagesCheck {
                dep: remote.clone(),
                timeout,
            }));
        }
    }
    checks.push(Arc::new(DiskCheck::new(artifact_dir, health.min_free_disk_mb)));
    checks.push(Arc::new(MemoryCheck::new(health.min_available_memory_mb)));
    checks
}
