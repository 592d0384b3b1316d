//! The top-level cycle loop.
//!
//! One orchestrator owns a run directory (enforced by [`RunLock`]). It runs
//! cycles strictly in index order, checkpoints every `checkpoint_interval`
//! cycles and on every exit, and keeps a [`HealthMonitor`] running beside the
//! loop for the whole run. Budget and cancellation are only checked between
//! cycles; a cycle in flight always finishes.

use super::state::{RunMetadata, RunSummary, StopReason};
use crate::config::SoakToml;
use crate::cycle::{CycleExecutor, CycleResult};
use crate::deps::{Dependencies, LoadState};
use crate::errors::ConfigError;
use crate::health::{HEALTH_LOG_FILE, HealthCheck, HealthMonitor, build_checks};
use crate::notify::{self, Notifier};
use crate::profile::ProfileGenerator;
use crate::repair::{REPAIR_LOG_FILE, RepairLog, build_controller};
use crate::report::ReportAggregator;
use crate::stage::Pipeline;
use crate::store::{ArtifactStore, Checkpoint, CheckpointStore, RunLock};
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type CycleHook = Box<dyn Fn(&CycleResult) + Send + Sync>;

pub struct Orchestrator {
    config: SoakToml,
    pipeline: Pipeline,
    notifier: Option<Arc<dyn Notifier>>,
    dependencies: Option<Dependencies>,
    checks: Option<Vec<Arc<dyn HealthCheck>>>,
    on_cycle: Option<CycleHook>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Stages come from `config.stages`.
    pub fn new(config: SoakToml) -> Self {
        let pipeline = Pipeline::from_config(&config.stages);
        Self {
            config,
            pipeline,
            notifier: None,
            dependencies: None,
            checks: None,
            on_cycle: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Use prebuilt handles instead of building them from `[dependencies]`.
    pub fn with_dependencies(mut self, deps: Dependencies) -> Self {
        self.dependencies = Some(deps);
        self
    }

    /// Replace the health checks derived from the dependencies.
    pub fn with_health_checks(mut self, checks: Vec<Arc<dyn HealthCheck>>) -> Self {
        self.checks = Some(checks);
        self
    }

    /// Called after each cycle's result is final.
    pub fn on_cycle_complete(mut self, hook: impl Fn(&CycleResult) + Send + Sync + 'static) -> Self {
        self.on_cycle = Some(Box::new(hook));
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run cycles until the cycle budget, the wall-clock budget or
    /// cancellation ends the loop. With `resume`, continue after the last
    /// checkpointed cycle of the run in `artifact_dir`.
    ///
    /// Only configuration and run-directory setup errors are returned; cycle
    /// failures are recorded in the summary.
    pub async fn run(&self, resume: bool) -> Result<RunSummary> {
        let run = &self.config.run;
        run.validate()?;
        if self.pipeline.is_empty() {
            return Err(ConfigError::NoStages.into());
        }

        let root = run.artifact_dir.clone();
        let _lock = RunLock::acquire(&root)?;
        let store = Arc::new(ArtifactStore::new(&root));
        store.ensure_root()?;
        let checkpoints = CheckpointStore::new(&root);

        // Resume point and run identity.
        let previous = if resume { RunMetadata::load(&root) } else { None };
        let checkpoint = if resume {
            checkpoints.load()
        } else {
            if checkpoints.path().exists() {
                warn!(dir = %root.display(), "starting a fresh run over an existing checkpoint");
                checkpoints.clear()?;
            }
            None
        };
        let start_cycle = checkpoint.as_ref().map(Checkpoint::next_cycle).unwrap_or(1);
        if resume && checkpoint.is_none() {
            warn!("no usable checkpoint; resuming from cycle 1");
        }

        let stage_names: Vec<String> = self.pipeline.stages().iter().map(|s| s.name().to_string()).collect();
        let metadata = match previous {
            Some(mut meta) => {
                meta.resumed_at.push(chrono::Utc::now());
                meta.cycles = run.cycles;
                meta
            }
            None => {
                let seed = run.seed.unwrap_or_else(ProfileGenerator::random_seed);
                RunMetadata::new(seed, run.cycles, stage_names.clone())
            }
        };
        metadata.save(&root)?;
        let run_id = metadata.run_id;
        let profiles = ProfileGenerator::new(run.seed.unwrap_or(metadata.seed));

        if run.parallelism > 1 {
            info!(
                parallelism = run.parallelism,
                "parallel cycles are not supported yet; running sequentially"
            );
        }
        info!(
            run_id = %run_id,
            cycles = run.cycles,
            start_cycle,
            stages = %stage_names.join(","),
            dir = %root.display(),
            "run started"
        );

        // Dependencies, monitor and repair.
        let health = &self.config.health;
        let deps = match &self.dependencies {
            Some(deps) => deps.clone(),
            None => Dependencies::from_config(
                &self.config.dependencies,
                run.substitute_search_provider,
                health.check_timeout(),
            )?,
        };
        self.install_database(&deps).await;

        let notifier = match &self.notifier {
            Some(n) => n.clone(),
            None => notify::from_config(&self.config.notify)?,
        };
        let repair_log = RepairLog::with_file(root.join(REPAIR_LOG_FILE));
        let controller = build_controller(&deps, repair_log.clone(), notifier, health.check_timeout());
        let checks = match &self.checks {
            Some(checks) => checks.clone(),
            None => build_checks(&deps, health, &root),
        };
        let (monitor, monitor_task) =
            HealthMonitor::new(checks, health.interval(), health.check_timeout())
                .with_repair(Arc::new(controller))
                .with_log(root.join(HEALTH_LOG_FILE))
                .spawn();

        let executor = CycleExecutor::new(self.pipeline.clone(), store.clone(), run)
            .with_dependencies(deps.clone())
            .with_monitor(monitor.clone());

        // The loop.
        let started = Instant::now();
        let mut results = Vec::new();
        let mut last_completed = checkpoint.as_ref().map(|c| c.last_completed_cycle).unwrap_or(0);
        let mut advanced = false;
        let mut first_unpersisted: Option<u32> = None;
        let mut stop_reason = StopReason::Completed;

        if start_cycle > run.cycles {
            info!(
                start_cycle,
                cycles = run.cycles,
                "checkpoint is at or past the last cycle; nothing to run"
            );
        }

        for index in start_cycle..=run.cycles {
            if self.cancel.is_cancelled() {
                stop_reason = StopReason::Cancelled;
                break;
            }
            if started.elapsed() > run.max_duration() {
                info!(
                    elapsed_secs = started.elapsed().as_secs(),
                    next_cycle = index,
                    "wall-clock budget exhausted"
                );
                stop_reason = StopReason::BudgetExhausted;
                break;
            }

            info!(cycle = index, total = run.cycles, "cycle started");
            let result = executor.run_cycle(index, &profiles.profile_for(index)).await;
            info!(
                cycle = index,
                success = result.success,
                attempts = result.attempts,
                duration_ms = result.duration.as_millis() as u64,
                error_kind = result.error_kind.map(|k| k.as_str()).unwrap_or(""),
                "cycle finished"
            );

            if let Some(db) = deps.database()
                && let Err(e) = db.record_cycle(run_id, &result).await
            {
                warn!(cycle = index, error = %format!("{:#}", e), "failed to index cycle result");
                monitor.request_check();
            }

            // The checkpoint only covers a contiguous prefix of persisted cycles.
            match first_unpersisted {
                None if store.is_persisted(index) => {
                    last_completed = index;
                    advanced = true;
                }
                None => {
                    error!(cycle = index, "cycle result was not persisted; checkpoint frozen");
                    first_unpersisted = Some(index);
                }
                Some(missing) => {
                    warn!(cycle = index, missing, "checkpoint held behind an unpersisted cycle");
                }
            }
            if let Some(hook) = &self.on_cycle {
                hook(&result);
            }
            results.push(result);

            if advanced && index % run.checkpoint_interval == 0 {
                save_checkpoint(&checkpoints, &store, last_completed, run_id);
            }
        }

        if advanced {
            save_checkpoint(&checkpoints, &store, last_completed, run_id);
        }

        monitor.stop();
        if tokio::time::timeout(Duration::from_secs(30), monitor_task)
            .await
            .is_err()
        {
            warn!("health monitor did not stop within 30s");
        }

        let summary = RunSummary::from_results(
            run_id,
            run.cycles,
            start_cycle,
            results,
            stop_reason,
            last_completed,
            started.elapsed(),
            repair_log.stats(),
            root.clone(),
        );
        summary.save(&root)?;

        match ReportAggregator::new(&root).build() {
            Ok(report) => {
                if let Err(e) = report.write(&root) {
                    warn!(error = %format!("{:#}", e), "failed to write report");
                }
            }
            Err(e) => warn!(error = %format!("{:#}", e), "failed to build report"),
        }

        info!(
            run_id = %run_id,
            attempted = summary.attempted,
            successful = summary.successful,
            failed = summary.failed,
            stop_reason = %summary.stop_reason,
            last_checkpoint = summary.last_checkpoint,
            "run finished"
        );
        Ok(summary)
    }

    /// Open the database index in the background and give it a bounded time.
    /// A slow or failed open leaves the slot empty for the repair loop.
    async fn install_database(&self, deps: &Dependencies) {
        let Some(db) = &deps.database else {
            return;
        };
        if db.slot.current().is_some() {
            return;
        }
        let lazy = deps.open_database();
        match lazy.wait(self.config.health.check_timeout()).await {
            LoadState::Ready(handle) => {
                db.slot.install(handle);
            }
            LoadState::Failed(e) => {
                warn!(path = %db.path.display(), error = %e, "database unavailable at start")
            }
            state => warn!(
                path = %db.path.display(),
                state = state.label(),
                "database not ready at start"
            ),
        }
    }
}

fn save_checkpoint(
    checkpoints: &CheckpointStore,
    store: &ArtifactStore,
    last_completed: u32,
    run_id: uuid::Uuid,
) {
    let results_count = match store.persisted_count(last_completed) {
        Ok(count) => count,
        Err(e) => {
            error!(
                error = %format!("{:#}", e),
                "failed to count persisted results; checkpoint not saved"
            );
            return;
        }
    };
    let checkpoint = Checkpoint::new(last_completed, results_count, Some(run_id));
    match checkpoints.save(&checkpoint) {
        Ok(()) => info!(last_completed_cycle = last_completed, results_count, "checkpoint saved"),
        Err(e) => error!(error = %format!("{:#}", e), "failed to save checkpoint"),
    }
}

/// Wire a fresh run's Ctrl-C handling to `cancel`.
pub fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current cycle");
            cancel.cancel();
        }
    });
}
