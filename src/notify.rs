//! Operator notifications. Delivery is best effort: callers go through
//! [`notify_quietly`] so a broken channel never reaches the monitor loop.

use crate::config::NotifyConfig;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Critical,
    High,
    Medium,
    Low,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Critical => "critical",
            Urgency::High => "high",
            Urgency::Medium => "medium",
            Urgency::Low => "low",
        }
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str, urgency: Urgency) -> Result<()>;
}

/// Writes notifications to the tracing log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, message: &str, urgency: Urgency) -> Result<()> {
        match urgency {
            Urgency::Critical | Urgency::High => {
                tracing::error!(urgency = %urgency, "{}", message)
            }
            Urgency::Medium => tracing::warn!(urgency = %urgency, "{}", message),
            Urgency::Low => tracing::info!(urgency = %urgency, "{}", message),
        }
        Ok(())
    }
}

/// Runs a shell command with `SOAK_MESSAGE` and `SOAK_URGENCY` set.
pub struct CommandNotifier {
    command: String,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, message: &str, urgency: Urgency) -> Result<()> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("SOAK_MESSAGE", message)
            .env("SOAK_URGENCY", urgency.as_str())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn notify command: {}", self.command))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .context("Notify command timed out")?
            .context("Failed to wait for notify command")?;
        if !output.status.success() {
            bail!(
                "Notify command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// POSTs `{"message", "urgency", "source"}` as JSON.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str, urgency: Urgency) -> Result<()> {
        let body = serde_json::json!({
            "message": message,
            "urgency": urgency,
            "source": "soak",
        });
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;
        if !response.status().is_success() {
            bail!("Webhook {} returned {}", self.url, response.status());
        }
        Ok(())
    }
}

/// Delivers to every inner notifier; reports the first failure after all ran.
pub struct MultiNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl MultiNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }
}

#[async_trait]
impl Notifier for MultiNotifier {
    async fn notify(&self, message: &str, urgency: Urgency) -> Result<()> {
        let mut first_error = None;
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(message, urgency).await
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Send and swallow any error.
pub async fn notify_quietly(notifier: &dyn Notifier, message: &str, urgency: Urgency) {
    if let Err(e) = notifier.notify(message, urgency).await {
        tracing::warn!(error = %format!("{:#}", e), urgency = %urgency, "notification failed");
    }
}

/// Log notifier plus whatever channels are configured.
pub fn from_config(config: &NotifyConfig) -> Result<Arc<dyn Notifier>> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(command) = &config.command {
        notifiers.push(Arc::new(CommandNotifier::new(command.clone())));
    }
    if let Some(url) = &config.webhook_url {
        notifiers.push(Arc::new(WebhookNotifier::new(url.clone())?));
    }
    Ok(Arc::new(MultiNotifier::new(notifiers)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(String, Urgency)>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, message: &str, urgency: Urgency) -> Result<()> {
            self.sent.lock().unwrap().push((message.to_string(), urgency));
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        async fn notify(&self, _message: &str, _urgency: Urgency) -> Result<()> {
            bail!("channel down")
        }
    }

    #[tokio::test]
    async fn test_command_notifier_passes_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("note.txt");
        let notifier = CommandNotifier::new(format!(
            "printf '%s|%s' \"$SOAK_URGENCY\" \"$SOAK_MESSAGE\" > {}",
            out.display()
        ));
        notifier.notify("disk full", Urgency::Critical).await.unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "critical|disk full");
    }

    #[tokio::test]
    async fn test_command_notifier_failure_is_error() {
        let err = CommandNotifier::new("echo nope >&2; exit 3")
            .notify("x", Urgency::Low)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[tokio::test]
    async fn test_multi_notifier_reaches_all_despite_failure() {
        let recording = Arc::new(Recording::default());
        let multi = MultiNotifier::new(vec![Arc::new(Broken), recording.clone()]);
        assert!(multi.notify("repair failed", Urgency::High).await.is_err());
        assert_eq!(recording.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_notify_quietly_swallows_errors() {
        notify_quietly(&Broken, "ignored", Urgency::Medium).await;
    }

    #[test]
    fn test_urgency_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Urgency::High).unwrap(), "\"high\"");
    }
}
