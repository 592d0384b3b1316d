//! Self-healing for unhealthy dependencies.
//!
//! The controller is driven from the health monitor's loop, one component at
//! a time. Every attempt produces exactly one [`RepairRecord`]. The operator
//! hears about the first failure of a streak, every `renotify_every`-th
//! failure after it, and the recovery that ends it. Repairs only ever restore
//! a dependency. They never touch validation or cycle outcomes.

pub mod log;
pub mod strategies;

pub use log::{ComponentRepairStats, REPAIR_LOG_FILE, RepairLog, RepairRecord, RepairStats};
pub use strategies::{
    DatabaseRepair, Escalate, HttpRepair, PackageRepair, RemoteShellRepair, SearchRepair,
};

use crate::deps::Dependencies;
use crate::health::{Component, HealthStatus};
use crate::notify::{Notifier, Urgency, notify_quietly};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Stop, diagnose, rebuild, verify, resume for one component.
#[async_trait]
pub trait RepairStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Push a short label onto `actions` for each step taken. `Ok` means the
    /// rebuilt handle passed verification and is installed.
    async fn repair(&self, status: &HealthStatus, actions: &mut Vec<String>) -> anyhow::Result<()>;
}

/// At the default 10s health interval, one reminder every five minutes.
pub const DEFAULT_RENOTIFY_EVERY: u32 = 30;

pub struct RepairController {
    strategies: HashMap<Component, Arc<dyn RepairStrategy>>,
    log: RepairLog,
    notifier: Arc<dyn Notifier>,
    renotify_every: u32,
    /// Consecutive failed attempts per component since its last success.
    streaks: Mutex<HashMap<Component, u32>>,
}

impl RepairController {
    pub fn new(log: RepairLog, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            strategies: HashMap::new(),
            log,
            notifier,
            renotify_every: DEFAULT_RENOTIFY_EVERY,
            streaks: Mutex::new(HashMap::new()),
        }
    }

    /// Repeat a failure notification once per `n` consecutive failures.
    pub fn with_renotify_every(mut self, n: u32) -> Self {
        self.renotify_every = n.max(1);
        self
    }

    pub fn with_strategy(mut self, component: Component, strategy: Arc<dyn RepairStrategy>) -> Self {
        self.strategies.insert(component, strategy);
        self
    }

    pub fn log(&self) -> &RepairLog {
        &self.log
    }

    /// Attempt one repair. Returns whether the component was restored.
    pub async fn repair(&self, status: &HealthStatus) -> bool {
        let component = status.component;
        let strategy: Arc<dyn RepairStrategy> = self
            .strategies
            .get(&component)
            .cloned()
            .unwrap_or_else(|| Arc::new(Escalate));

        info!(component = %component, strategy = strategy.name(), "repair started");
        let start = Instant::now();
        let mut actions = Vec::new();
        let outcome = strategy.repair(status, &mut actions).await;
        let duration = start.elapsed();

        let error = outcome.as_ref().err().map(|e| format!("{:#}", e));
        self.log.append(RepairRecord {
            timestamp: Utc::now(),
            component,
            strategy: strategy.name().to_string(),
            success: outcome.is_ok(),
            duration,
            error: error.clone(),
            actions: actions.clone(),
        });

        match error {
            None => {
                info!(
                    component = %component,
                    duration_ms = duration.as_millis() as u64,
                    actions = %actions.join(","),
                    "repair succeeded"
                );
                let streak = self.end_streak(component);
                if streak > 0 {
                    notify_quietly(
                        self.notifier.as_ref(),
                        &format!("soak: {} recovered after {} failed repairs", component, streak),
                        Urgency::Low,
                    )
                    .await;
                }
                true
            }
            Some(error) => {
                let streak = self.extend_streak(component);
                warn!(component = %component, error = %error, streak, "repair failed");
                if (streak - 1) % self.renotify_every == 0 {
                    let urgency = if component.is_local_resource() {
                        Urgency::Critical
                    } else {
                        Urgency::High
                    };
                    let message = if streak == 1 {
                        format!("soak: repair of {} failed: {}", component, error)
                    } else {
                        format!(
                            "soak: repair of {} still failing ({} attempts): {}",
                            component, streak, error
                        )
                    };
                    notify_quietly(self.notifier.as_ref(), &message, urgency).await;
                }
                false
            }
        }
    }

    fn extend_streak(&self, component: Component) -> u32 {
        let mut streaks = self.streaks.lock().unwrap_or_else(|e| e.into_inner());
        let streak = streaks.entry(component).or_insert(0);
        *streak += 1;
        *streak
    }

    fn end_streak(&self, component: Component) -> u32 {
        let mut streaks = self.streaks.lock().unwrap_or_else(|e| e.into_inner());
        streaks.remove(&component).unwrap_or(0)
    }
}

/// A controller with a strategy for every configured dependency.
pub fn build_controller(
    deps: &Dependencies,
    log: RepairLog,
    notifier: Arc<dyn Notifier>,
    probe_timeout: Duration,
) -> RepairController {
    let mut controller = RepairController::new(log, notifier)
        .with_strategy(Component::Disk, Arc::new(Escalate))
        .with_strategy(Component::Memory, Arc::new(Escalate));

    if let Some(db) = &deps.database {
        controller = controller.with_strategy(Component::Database, Arc::new(DatabaseRepair::new(db.clone())));
    }
    if let Some(api) = &deps.llm_api {
        controller = controller.with_strategy(
            Component::LlmApi,
            Arc::new(HttpRepair::new(api.clone(), deps.request_timeout)),
        );
    }
    if let Some(index) = &deps.vector_index {
        controller = controller.with_strategy(
            Component::VectorIndex,
            Arc::new(HttpRepair::new(index.clone(), deps.request_timeout)),
        );
    }
    if let Some(search) = &deps.search {
        controller = controller.with_strategy(
            Component::Search,
            Arc::new(SearchRepair::new(search.clone(), deps.request_timeout)),
        );
    }
    if let Some(remote) = &deps.remote_shell {
        controller = controller
            .with_strategy(
                Component::RemoteShell,
                Arc::new(RemoteShellRepair::new(remote.clone(), probe_timeout)),
            )
            .with_strategy(
                Component::RemotePackages,
                Arc::new(PackageRepair::new(remote.clone(), probe_timeout)),
            );
    }
    controller
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Recording {
        sent: Mutex<Vec<(String, Urgency)>>,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn notify(&self, message: &str, urgency: Urgency) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push((message.to_string(), urgency));
            Ok(())
        }
    }

    struct FailThenFix {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RepairStrategy for FailThenFix {
        fn name(&self) -> &'static str {
            "fail_then_fix"
        }

        async fn repair(&self, _status: &HealthStatus, actions: &mut Vec<String>) -> anyhow::Result<()> {
            actions.push("rebuilt".into());
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                bail!("verification failed");
            }
            actions.push("verified".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_every_attempt_is_recorded_and_failures_notify() {
        let notifier = Arc::new(Recording::default());
        let controller = RepairController::new(RepairLog::in_memory(), notifier.clone())
            .with_strategy(
                Component::Database,
                Arc::new(FailThenFix {
                    calls: AtomicU32::new(0),
                }),
            );
        let status = HealthStatus::unhealthy(Component::Database, "down");

        assert!(!controller.repair(&status).await);
        assert!(controller.repair(&status).await);

        let records = controller.log().records();
        assert_eq!(records.len(), 2);
        assert!(!records[0].success);
        assert_eq!(records[0].error.as_deref(), Some("verification failed"));
        assert!(records[1].success);
        assert_eq!(records[1].actions, vec!["rebuilt", "verified"]);

        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].1, Urgency::High);
        assert_eq!(sent[1].1, Urgency::Low);
        assert!(sent[1].0.contains("recovered after 1 failed repairs"));
    }

    #[tokio::test]
    async fn test_persistent_failure_notifies_once_per_streak_window() {
        let notifier = Arc::new(Recording::default());
        let controller = build_controller(
            &Dependencies::default(),
            RepairLog::in_memory(),
            notifier.clone(),
            Duration::from_secs(1),
        );
        let status = HealthStatus::unhealthy(Component::Disk, "10 MB free, need 1024 MB");

        for _ in 0..3 {
            assert!(!controller.repair(&status).await);
        }
        assert_eq!(controller.log().len(), 3);
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);

        let controller = build_controller(
            &Dependencies::default(),
            RepairLog::in_memory(),
            notifier.clone(),
            Duration::from_secs(1),
        )
        .with_renotify_every(2);
        notifier.sent.lock().unwrap().clear();
        for _ in 0..5 {
            controller.repair(&status).await;
        }
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert!(sent[1].0.contains("still failing (3 attempts)"));
        assert!(sent.iter().all(|(_, urgency)| *urgency == Urgency::Critical));
        assert_eq!(controller.log().len(), 5);
    }

    #[tokio::test]
    async fn test_streaks_are_per_component() {
        let notifier = Arc::new(Recording::default());
        let controller = build_controller(
            &Dependencies::default(),
            RepairLog::in_memory(),
            notifier.clone(),
            Duration::from_secs(1),
        );
        controller.repair(&HealthStatus::unhealthy(Component::Disk, "low")).await;
        controller.repair(&HealthStatus::unhealthy(Component::Memory, "low")).await;
        controller.repair(&HealthStatus::unhealthy(Component::Disk, "low")).await;
        assert_eq!(notifier.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_local_resources_escalate_critical() {
        let notifier = Arc::new(Recording::default());
        let controller = build_controller(
            &Dependencies::default(),
            RepairLog::in_memory(),
            notifier.clone(),
            Duration::from_secs(1),
        );

        let status = HealthStatus::unhealthy(Component::Disk, "10 MB free, need 1024 MB");
        assert!(!controller.repair(&status).await);

        let records = controller.log().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].strategy, "escalate");
        assert_eq!(notifier.sent.lock().unwrap()[0].1, Urgency::Critical);
    }

    #[tokio::test]
    async fn test_unconfigured_component_escalates() {
        let controller = RepairController::new(RepairLog::in_memory(), Arc::new(Recording::default()));
        assert!(
            !controller
                .repair(&HealthStatus::unhealthy(Component::VectorIndex, "down"))
                .await
        );
        assert_eq!(controller.log().len(), 1);
    }
}
