//! Stages executed as external commands.
//!
//! The command runs under `sh -c`, receives the [`StageInput`] as JSON on
//! stdin and writes its result to stdout:
//! - JSON `{structured?, text?, score?}` is used as-is
//! - any other stdout becomes the plain-text output
//!
//! Exit code 0 = success, 75 (EX_TEMPFAIL) = a dependency is unavailable
//! (name it with `dependency:<component>` on stderr), anything else = a
//! recoverable failure.

use super::{StageContext, StageInput, StageOutput, StageRunner};
use crate::config::StageConfig;
use crate::errors::StageError;
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Exit status a stage uses to report an unreachable dependency.
pub const EXIT_DEPENDENCY_UNAVAILABLE: i32 = 75;

const STDERR_TAIL_CHARS: usize = 2000;

pub struct CommandStageRunner {
    name: String,
    command: String,
    env: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct CommandOutput {
    #[serde(default)]
    structured: Option<serde_json::Value>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    score: Option<f64>,
}

impl CommandStageRunner {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &StageConfig) -> Self {
        Self {
            name: config.name.clone(),
            command: config.command.clone(),
            env: config.env.clone(),
        }
    }

    fn parse_output(&self, output: &std::process::Output) -> Result<StageOutput, StageError> {
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match exit_code {
            0 => {}
            EXIT_DEPENDENCY_UNAVAILABLE => {
                return Err(StageError::DependencyUnavailable {
                    stage: self.name.clone(),
                    component: dependency_from_stderr(&stderr)
                        .unwrap_or_else(|| "unknown".to_string()),
                    message: tail(stderr.trim(), STDERR_TAIL_CHARS),
                });
            }
            _ => {
                let reason = if !stderr.trim().is_empty() {
                    format!("exit {}: {}", exit_code, tail(stderr.trim(), STDERR_TAIL_CHARS))
                } else {
                    format!("exit {}", exit_code)
                };
                return Err(StageError::recoverable(&self.name, reason));
            }
        }

        let trimmed = stdout.trim();
        if let Ok(parsed) = serde_json::from_str::<CommandOutput>(trimmed)
            && (parsed.structured.is_some() || parsed.text.is_some() || parsed.score.is_some())
        {
            let mut out = StageOutput::text(&self.name, parsed.text.unwrap_or_default());
            if let Some(structured) = parsed.structured {
                out = out.with_structured(structured);
            }
            if let Some(score) = parsed.score {
                out = out.with_score(score);
            }
            return Ok(out);
        }

        Ok(StageOutput::text(&self.name, trimmed))
    }
}

#[async_trait]
impl StageRunner for CommandStageRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, input: &StageInput, ctx: &StageContext) -> Result<StageOutput, StageError> {
        let input_json = serde_json::to_string(input)
            .map_err(|e| StageError::recoverable(&self.name, format!("serialize input: {}", e)))?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&ctx.env)
            .envs(&self.env)
            .env("SOAK_STAGE", &self.name)
            .env("SOAK_CYCLE", input.cycle.to_string())
            .env("SOAK_ATTEMPT", input.attempt.to_string())
            // Dropping the attempt future on deadline must kill the child.
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StageError::recoverable(&self.name, format!("spawn '{}': {}", self.command, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A stage that ignores stdin may close it early; that is not an error.
            let _ = stdin.write_all(input_json.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| StageError::recoverable(&self.name, format!("wait: {}", e)))?;

        self.parse_output(&output)
    }
}

static DEPENDENCY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bdependency:([A-Za-z0-9_]+)").unwrap());

fn dependency_from_stderr(stderr: &str) -> Option<String> {
    DEPENDENCY_REGEX
        .captures(stderr)
        .map(|caps| caps[1].to_string())
}

fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        s.to_string()
    } else {
        s.chars().skip(count - max_chars).collect()
    }
}
