//! Per-component repair strategies.

use super::RepairStrategy;
use crate::config::HttpEndpointConfig;
use crate::deps::{
    DatabaseDependency, DatabaseHandle, HttpDependency, HttpEndpoint, RemoteDependency,
    RemoteShell, SearchDependency,
};
use crate::health::HealthStatus;
use crate::health::checks::missing_packages;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// No automatic remedy: record the failure and let the controller notify.
pub struct Escalate;

#[async_trait]
impl RepairStrategy for Escalate {
    fn name(&self) -> &'static str {
        "escalate"
    }

    async fn repair(&self, status: &HealthStatus, actions: &mut Vec<String>) -> Result<()> {
        actions.push("escalated".into());
        bail!(
            "no automatic remedy for {}: {}",
            status.component,
            status.error.as_deref().unwrap_or("unhealthy")
        )
    }
}

pub struct DatabaseRepair {
    dep: DatabaseDependency,
}

impl DatabaseRepair {
    pub fn new(dep: DatabaseDependency) -> Self {
        Self { dep }
    }
}

#[async_trait]
impl RepairStrategy for DatabaseRepair {
    fn name(&self) -> &'static str {
        "reopen_database"
    }

    async fn repair(&self, _status: &HealthStatus, actions: &mut Vec<String>) -> Result<()> {
        if self.dep.slot.take().is_some() {
            actions.push("released_handle".into());
        }

        let path = self.dep.path.clone();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
            actions.push("created_parent_dir".into());
        }
        if let Ok(meta) = std::fs::metadata(&path)
            && meta.permissions().readonly()
        {
            bail!("{} is read-only", path.display());
        }

        let handle = tokio::task::spawn_blocking(move || DatabaseHandle::open(&path))
            .await
            .context("Database open task panicked")??;
        actions.push("reopened".into());

        if let Some(problem) = handle.integrity_problem().await? {
            bail!("integrity check failed: {}", problem);
        }
        handle.ping().await.context("Verification query failed")?;
        actions.push("verified".into());

        self.dep.slot.replace(handle);
        actions.push("installed".into());
        Ok(())
    }
}

fn quota_exhausted(status: &HealthStatus) -> bool {
    status
        .metrics
        .get("remaining_quota")
        .and_then(|v| v.as_u64())
        == Some(0)
        || status
            .error
            .as_deref()
            .is_some_and(|e| e.contains("quota exhausted"))
}

/// Build a client from `config` and require a passing probe.
async fn rebuild_endpoint(
    config: &HttpEndpointConfig,
    timeout: Duration,
    substitute: bool,
    actions: &mut Vec<String>,
) -> Result<HttpEndpoint> {
    let endpoint = HttpEndpoint::build(config, timeout, substitute)?;
    if let Some(var) = endpoint.missing_api_key() {
        bail!("API key variable {} is not set", var);
    }
    actions.push("rebuilt_client".into());

    let probe = endpoint.probe().await?;
    if probe.quota_exhausted() {
        bail!("quota exhausted at {} (HTTP {})", endpoint.url(), probe.status);
    }
    if !probe.is_success() {
        bail!("probe {} returned HTTP {}", endpoint.probe_url(), probe.status);
    }
    actions.push("verified".into());
    Ok(endpoint)
}

/// LLM-style API and vector index.
pub struct HttpRepair {
    dep: HttpDependency,
    timeout: Duration,
}

impl HttpRepair {
    pub fn new(dep: HttpDependency, timeout: Duration) -> Self {
        Self { dep, timeout }
    }
}

#[async_trait]
impl RepairStrategy for HttpRepair {
    fn name(&self) -> &'static str {
        "rebuild_client"
    }

    async fn repair(&self, status: &HealthStatus, actions: &mut Vec<String>) -> Result<()> {
        if quota_exhausted(status) {
            bail!("quota exhausted; waiting for the provider to reset it");
        }
        if self.dep.slot.take().is_some() {
            actions.push("released_handle".into());
        }
        let endpoint = rebuild_endpoint(&self.dep.config, self.timeout, false, actions).await?;
        self.dep.slot.replace(endpoint);
        actions.push("installed".into());
        Ok(())
    }
}

/// Search: primary first, then the substitute if the run allowed one.
pub struct SearchRepair {
    dep: SearchDependency,
    timeout: Duration,
}

impl SearchRepair {
    pub fn new(dep: SearchDependency, timeout: Duration) -> Self {
        Self { dep, timeout }
    }
}

#[async_trait]
impl RepairStrategy for SearchRepair {
    fn name(&self) -> &'static str {
        "rebuild_search"
    }

    async fn repair(&self, status: &HealthStatus, actions: &mut Vec<String>) -> Result<()> {
        let primary_quota = quota_exhausted(status);
        if primary_quota && !self.dep.allow_substitute {
            bail!("quota exhausted; waiting for the provider to reset it");
        }
        if self.dep.slot.take().is_some() {
            actions.push("released_handle".into());
        }

        let primary_err = if primary_quota {
            anyhow::anyhow!("primary quota exhausted")
        } else {
            match rebuild_endpoint(&self.dep.config.primary(), self.timeout, false, actions).await {
                Ok(endpoint) => {
                    self.dep.slot.replace(endpoint);
                    actions.push("installed".into());
                    return Ok(());
                }
                Err(e) => e,
            }
        };

        let substitute = match (self.dep.allow_substitute, self.dep.config.substitute()) {
            (true, Some(substitute)) => substitute,
            _ => return Err(primary_err),
        };
        let endpoint = rebuild_endpoint(&substitute, self.timeout, true, actions)
            .await
            .with_context(|| format!("primary failed ({:#}); substitute also failed", primary_err))?;
        self.dep.slot.replace(endpoint);
        actions.push("switched_to_substitute".into());
        Ok(())
    }
}

pub struct RemoteShellRepair {
    dep: RemoteDependency,
    timeout: Duration,
    ssh_dir: Option<PathBuf>,
    keyscan_program: String,
    accept_agent: bool,
}

impl RemoteShellRepair {
    pub fn new(dep: RemoteDependency, timeout: Duration) -> Self {
        Self {
            dep,
            timeout,
            ssh_dir: dirs::home_dir().map(|home| home.join(".ssh")),
            keyscan_program: "ssh-keyscan".to_string(),
            accept_agent: true,
        }
    }

    pub fn with_ssh_dir(mut self, dir: PathBuf) -> Self {
        self.ssh_dir = Some(dir);
        self
    }

    pub fn with_keyscan_program(mut self, program: impl Into<String>) -> Self {
        self.keyscan_program = program.into();
        self
    }

    /// Whether a running ssh-agent counts as local credentials.
    pub fn with_agent(mut self, accept: bool) -> Self {
        self.accept_agent = accept;
        self
    }

    fn has_credentials(&self) -> bool {
        if self.accept_agent && std::env::var_os("SSH_AUTH_SOCK").is_some_and(|s| !s.is_empty()) {
            return true;
        }
        self.ssh_dir.as_deref().is_some_and(has_private_key)
    }

    async fn trust_host_key(&self, host: &str, ssh_dir: &Path) -> Result<()> {
        let output = Command::new(&self.keyscan_program)
            .args(["-T", &self.timeout.as_secs().max(1).to_string(), host])
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.keyscan_program))?;
        let keys = String::from_utf8_lossy(&output.stdout);
        if keys.trim().is_empty() {
            bail!("{} returned no host keys for {}", self.keyscan_program, host);
        }

        std::fs::create_dir_all(ssh_dir)
            .with_context(|| format!("Failed to create {}", ssh_dir.display()))?;
        let known_hosts = ssh_dir.join("known_hosts");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&known_hosts)
            .with_context(|| format!("Failed to open {}", known_hosts.display()))?;
        file.write_all(keys.as_bytes())?;
        if !keys.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        Ok(())
    }
}

fn has_private_key(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        name.starts_with("id_") && !name.ends_with(".pub") && entry.path().is_file()
    })
}

#[async_trait]
impl RepairStrategy for RemoteShellRepair {
    fn name(&self) -> &'static str {
        "reconnect_remote_shell"
    }

    async fn repair(&self, _status: &HealthStatus, actions: &mut Vec<String>) -> Result<()> {
        let previous = self.dep.slot.take();
        if previous.is_some() {
            actions.push("released_handle".into());
        }

        if !self.has_credentials() {
            bail!("no private key under ~/.ssh and no ssh-agent available");
        }
        actions.push("credentials_present".into());

        // Keep any client override from the previous session parameters.
        let mut shell = RemoteShell::from_config(&self.dep.config);
        if let Some(previous) = &previous {
            shell = shell.with_program(previous.program());
            for option in previous.options() {
                shell = shell.with_option(option.clone());
            }
        }

        let first = shell.exec("true", self.timeout).await?;
        if !first.success() {
            if !first.host_key_rejected() {
                bail!(
                    "connection to {} failed ({:?}): {}",
                    shell.destination(),
                    first.code,
                    first.stderr.trim()
                );
            }
            let Some(ssh_dir) = self.ssh_dir.as_deref() else {
                bail!("host key rejected and no ~/.ssh directory to record it in");
            };
            self.trust_host_key(shell.host(), ssh_dir).await?;
            actions.push("added_known_host".into());

            let second = shell.exec("true", self.timeout).await?;
            if !second.success() {
                bail!(
                    "connection to {} still failing after trusting host key: {}",
                    shell.destination(),
                    second.stderr.trim()
                );
            }
        }
        actions.push("verified".into());

        self.dep.slot.replace(shell);
        actions.push("installed".into());
        Ok(())
    }
}

/// Install missing packages over the remote shell, then re-list.
pub struct PackageRepair {
    dep: RemoteDependency,
    timeout: Duration,
}

impl PackageRepair {
    pub fn new(dep: RemoteDependency, timeout: Duration) -> Self {
        Self { dep, timeout }
    }

    async fn missing(&self, shell: &RemoteShell) -> Result<Vec<String>> {
        let out = shell.exec(&self.dep.config.list_command, self.timeout).await?;
        if !out.success() {
            bail!("list command failed ({:?}): {}", out.code, out.stderr.trim());
        }
        Ok(missing_packages(&out.stdout, &self.dep.config.required_packages))
    }
}

#[async_trait]
impl RepairStrategy for PackageRepair {
    fn name(&self) -> &'static str {
        "install_packages"
    }

    async fn repair(&self, _status: &HealthStatus, actions: &mut Vec<String>) -> Result<()> {
        // The session itself belongs to the remote_shell repair.
        let Some(shell) = self.dep.slot.current() else {
            bail!("remote shell is unavailable");
        };

        let missing = self.missing(&shell).await?;
        for package in &missing {
            let command = self.dep.config.install_command.replace("{package}", package);
            let out = shell.exec(&command, self.timeout).await?;
            if !out.success() {
                bail!("installing {} failed ({:?}): {}", package, out.code, out.stderr.trim());
            }
            actions.push(format!("installed:{}", package));
        }

        let still_missing = self.missing(&shell).await?;
        if !still_missing.is_empty() {
            bail!("still missing after install: {}", still_missing.join(", "));
        }
        actions.push("verified_listing".into());
        Ok(())
    }
}
