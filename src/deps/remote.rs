use crate::config::RemoteShellConfig;
use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Non-interactive remote shell session parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteShell {
    program: String,
    host: String,
    user: Option<String>,
    connect_timeout: Duration,
    options: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn host_key_rejected(&self) -> bool {
        self.stderr.contains("Host key verification failed")
            || self.stderr.contains("No ED25519 host key is known")
            || self.stderr.contains("REMOTE HOST IDENTIFICATION HAS CHANGED")
    }
}

impl RemoteShell {
    pub fn from_config(config: &RemoteShellConfig) -> Self {
        Self {
            program: "ssh".to_string(),
            host: config.host.clone(),
            user: config.user.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            options: Vec::new(),
        }
    }

    /// Use a different client binary (tests point this at a fake).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Add an `-o` option; used by repairs to rebuild with corrected settings.
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        let option = option.into();
        if !self.options.contains(&option) {
            self.options.push(option);
        }
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }

    pub fn args(&self, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args.push(self.destination());
        args.push(command.to_string());
        args
    }

    /// Run `command` remotely. The process is killed if `timeout` elapses.
    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<RemoteOutput> {
        let child = Command::new(&self.program)
            .args(self.args(command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .with_context(|| {
                format!(
                    "{} to {} timed out after {}s",
                    self.program,
                    self.destination(),
                    timeout.as_secs_f64()
                )
            })?
            .context("Failed to wait for remote command")?;

        Ok(RemoteOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RemoteShellConfig {
        RemoteShellConfig {
            host: "gpu-box".into(),
            user: Some("runner".into()),
            connect_timeout_secs: 3,
            required_packages: vec![],
            list_command: "pip list".into(),
            install_command: "pip install {package}".into(),
        }
    }

    #[test]
    fn test_args_are_non_interactive() {
        let shell = RemoteShell::from_config(&config());
        let args = shell.args("true");
        assert_eq!(
            args,
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=3",
                "runner@gpu-box",
                "true"
            ]
        );
    }

    #[test]
    fn test_with_option_is_deduplicated() {
        let shell = RemoteShell::from_config(&config())
            .with_option("StrictHostKeyChecking=accept-new")
            .with_option("StrictHostKeyChecking=accept-new");
        assert_eq!(shell.options().len(), 1);
        assert!(shell.args("true").contains(&"StrictHostKeyChecking=accept-new".to_string()));
    }

    #[test]
    fn test_host_key_rejection_detected() {
        let out = RemoteOutput {
            code: Some(255),
            stdout: String::new(),
            stderr: "Host key verification failed.\r\n".into(),
        };
        assert!(out.host_key_rejected());
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_exec_through_fake_client() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-ssh");
        std::fs::write(&fake, "#!/bin/sh\nfor last; do :; done\nsh -c \"$last\"\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let shell = RemoteShell::from_config(&config()).with_program(fake.display().to_string());
        let out = shell.exec("echo remote-ok", Duration::from_secs(5)).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "remote-ok");
    }

    #[tokio::test]
    async fn test_exec_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-ssh");
        std::fs::write(&fake, "#!/bin/sh\nsleep 5\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let shell = RemoteShell::from_config(&config()).with_program(fake.display().to_string());
        let err = shell
            .exec("true", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
