//! Runs one cycle: all stages in order under a per-attempt deadline, retried
//! from the first stage until the attempt budget is spent.

use super::result::{AttemptRecord, CycleResult};
use crate::config::RunConfig;
use crate::deps::Dependencies;
use crate::errors::StageError;
use crate::health::MonitorHandle;
use crate::profile::Profile;
use crate::stage::{Pipeline, StageContext, StageInput, StageOutput};
use crate::store::ArtifactStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Progress of the attempt in flight. Lives outside the attempt future so it
/// survives the future being dropped at the deadline.
#[derive(Default)]
struct AttemptProgress {
    completed: Vec<String>,
    score: Option<f64>,
    persist_failed: bool,
}

pub struct CycleExecutor {
    pipeline: Pipeline,
    store: Arc<ArtifactStore>,
    deps: Dependencies,
    monitor: Option<MonitorHandle>,
    timeout: Duration,
    attempt_budget: u32,
    retry_delay: Duration,
}

impl CycleExecutor {
    pub fn new(pipeline: Pipeline, store: Arc<ArtifactStore>, config: &RunConfig) -> Self {
        Self {
            pipeline,
            store,
            deps: Dependencies::default(),
            monitor: None,
            timeout: config.timeout_per_cycle(),
            attempt_budget: config.attempt_budget(),
            retry_delay: config.retry_delay(),
        }
    }

    pub fn with_dependencies(mut self, deps: Dependencies) -> Self {
        self.deps = deps;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorHandle) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Run cycle `index`. Never fails: exhausted attempts produce a failed
    /// [`CycleResult`] carrying the last error verbatim.
    pub async fn run_cycle(&self, index: u32, profile: &Profile) -> CycleResult {
        let cycle_start = Instant::now();
        let mut artifacts_ok = true;

        if let Err(e) = self.store.begin_cycle(index, profile) {
            warn!(cycle = index, error = %format!("{:#}", e), "failed to prepare cycle directory");
            artifacts_ok = false;
        }

        let mut attempt = 0;
        let result = loop {
            attempt += 1;
            if attempt > 1 && !self.retry_delay.is_zero() {
                tokio::time::sleep(self.retry_delay).await;
            }

            let started_at = Utc::now();
            let attempt_start = Instant::now();
            let mut progress = AttemptProgress::default();

            let outcome = match tokio::time::timeout(
                self.timeout,
                self.run_attempt(index, attempt, profile, &mut progress),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(StageError::Timeout {
                    elapsed: self.timeout,
                }),
            };
            artifacts_ok &= !progress.persist_failed;

            let record = AttemptRecord {
                attempt,
                started_at,
                duration: attempt_start.elapsed(),
                success: outcome.is_ok(),
                stages_completed: progress.completed.clone(),
                error_kind: outcome.as_ref().err().map(StageError::kind),
                error: outcome.as_ref().err().map(ToString::to_string),
            };
            if let Err(e) = self.store.record_attempt(index, &record) {
                warn!(cycle = index, attempt, error = %format!("{:#}", e), "failed to record attempt");
                artifacts_ok = false;
            }

            match outcome {
                Ok(()) => {
                    if let Some(score) = progress.score
                        && let Err(e) = self.store.save_score(index, score)
                    {
                        warn!(cycle = index, error = %format!("{:#}", e), "failed to save score");
                        artifacts_ok = false;
                    }
                    break CycleResult::success(
                        index,
                        progress.completed,
                        progress.score,
                        attempt,
                        cycle_start.elapsed(),
                    );
                }
                Err(err) => {
                    warn!(
                        cycle = index,
                        attempt,
                        budget = self.attempt_budget,
                        kind = %err.kind(),
                        error = %err,
                        "cycle attempt failed"
                    );
                    if let Some(component) = err.dependency()
                        && let Some(monitor) = &self.monitor
                    {
                        info!(cycle = index, component, "requesting early health check");
                        monitor.request_check();
                    }
                    if attempt >= self.attempt_budget {
                        break CycleResult::failure(
                            index,
                            progress.completed,
                            err.to_string(),
                            err.kind(),
                            attempt,
                            cycle_start.elapsed(),
                        );
                    }
                }
            }
        };

        let mut result = result.with_artifact_saved(artifacts_ok);
        if let Err(e) = self.store.save_result(&result) {
            warn!(cycle = index, error = %format!("{:#}", e), "failed to save cycle result");
            result.artifact_saved = false;
        }
        result
    }

    async fn run_attempt(
        &self,
        index: u32,
        attempt: u32,
        profile: &Profile,
        progress: &mut AttemptProgress,
    ) -> Result<(), StageError> {
        let mut previous: Option<StageOutput> = None;

        for (i, stage) in self.pipeline.stages().iter().enumerate() {
            let position = i + 1;
            let input = StageInput {
                cycle: index,
                attempt,
                stage: stage.name().to_string(),
                position,
                profile: profile.clone(),
                previous: previous.take(),
            };

            // Handles may have been swapped by a repair since the last stage.
            let mut ctx = StageContext {
                env: self.deps.stage_env(),
            };
            ctx.env.insert("SOAK_CYCLE".to_string(), index.to_string());
            ctx.env.insert("SOAK_ATTEMPT".to_string(), attempt.to_string());

            let output = stage.runner.run(&input, &ctx).await?;

            if let Err(e) = self.store.save_stage(index, attempt, position, &output) {
                warn!(cycle = index, stage = stage.name(), error = %format!("{:#}", e), "failed to persist stage output");
                progress.persist_failed = true;
            }

            stage.contract.validate(&output)?;

            progress.completed.push(stage.name().to_string());
            if output.score.is_some() {
                progress.score = output.score;
            }
            previous = Some(output);
        }

        Ok(())
    }
}
