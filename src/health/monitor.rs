//! The polling loop. Runs beside the cycle loop for the whole run and shares
//! nothing with it except the dependency slots and the repair log.

use super::{Component, HealthCheck, HealthStatus};
use crate::repair::RepairController;
use crate::store::append_jsonl;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Latest = Arc<RwLock<HashMap<Component, HealthStatus>>>;

pub struct HealthMonitor {
    checks: Vec<Arc<dyn HealthCheck>>,
    repair: Option<Arc<RepairController>>,
    interval: Duration,
    check_timeout: Duration,
    log_path: Option<PathBuf>,
    latest: Latest,
    wake: Arc<Notify>,
    ticks: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// Cheap, cloneable view of a running monitor.
#[derive(Clone)]
pub struct MonitorHandle {
    latest: Latest,
    wake: Arc<Notify>,
    ticks: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl MonitorHandle {
    /// Run the next tick now instead of waiting for the interval.
    pub fn request_check(&self) {
        self.wake.notify_one();
    }

    pub fn latest(&self) -> HashMap<Component, HealthStatus> {
        self.latest
            .read()
            .map(|m| m.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    pub fn status(&self, component: Component) -> Option<HealthStatus> {
        self.latest().remove(&component)
    }

    /// Completed ticks so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl HealthMonitor {
    pub fn new(checks: Vec<Arc<dyn HealthCheck>>, interval: Duration, check_timeout: Duration) -> Self {
        Self {
            checks,
            repair: None,
            interval,
            check_timeout,
            log_path: None,
            latest: Arc::new(RwLock::new(HashMap::new())),
            wake: Arc::new(Notify::new()),
            ticks: Arc::new(AtomicU64::new(0)),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_repair(mut self, repair: Arc<RepairController>) -> Self {
        self.repair = Some(repair);
        self
    }

    pub fn with_log(mut self, path: PathBuf) -> Self {
        self.log_path = Some(path);
        self
    }

    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            latest: self.latest.clone(),
            wake: self.wake.clone(),
            ticks: self.ticks.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Check every component, then repair the unhealthy ones one at a time.
    pub async fn tick(&self) -> Vec<HealthStatus> {
        let statuses = join_all(self.checks.iter().map(|check| self.run_check(check.as_ref()))).await;

        {
            let mut latest = self.latest.write().unwrap_or_else(|e| e.into_inner());
            latest.clear();
            for status in &statuses {
                latest.insert(status.component, status.clone());
            }
        }

        for status in &statuses {
            if let Some(path) = &self.log_path
                && let Err(e) = append_jsonl(path, status)
            {
                warn!(error = %format!("{:#}", e), "failed to append health log");
            }
            if status.healthy {
                debug!(component = %status.component, "healthy");
            } else {
                warn!(
                    component = %status.component,
                    error = status.error.as_deref().unwrap_or(""),
                    "unhealthy dependency"
                );
            }
        }

        if let Some(repair) = &self.repair {
            for status in statuses.iter().filter(|s| !s.healthy) {
                if self.cancel.is_cancelled() {
                    break;
                }
                repair.repair(status).await;
            }
        }

        self.ticks.fetch_add(1, Ordering::SeqCst);
        statuses
    }

    async fn run_check(&self, check: &dyn HealthCheck) -> HealthStatus {
        match tokio::time::timeout(self.check_timeout, check.check()).await {
            Ok(status) => status,
            Err(_) => HealthStatus::unhealthy(
                check.component(),
                format!("check timed out after {}s", self.check_timeout.as_secs_f64()),
            ),
        }
    }

    /// Start the loop on its own task.
    pub fn spawn(self) -> (MonitorHandle, JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        (handle, task)
    }

    async fn run(self) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            checks = self.checks.len(),
            "health monitor started"
        );
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.tick().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.wake.notified() => debug!("early health check requested"),
            }
        }
        info!(ticks = self.ticks.load(Ordering::SeqCst), "health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    struct Toggle {
        up: Arc<AtomicBool>,
    }

    #[async_trait]
    impl HealthCheck for Toggle {
        fn component(&self) -> Component {
            Component::Database
        }

        async fn check(&self) -> HealthStatus {
            if self.up.load(Ordering::SeqCst) {
                HealthStatus::healthy(Component::Database)
            } else {
                HealthStatus::unhealthy(Component::Database, "down")
            }
        }
    }

    struct Stuck;

    #[async_trait]
    impl HealthCheck for Stuck {
        fn component(&self) -> Component {
            Component::VectorIndex
        }

        async fn check(&self) -> HealthStatus {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            HealthStatus::healthy(Component::VectorIndex)
        }
    }

    #[tokio::test]
    async fn test_tick_replaces_latest_and_appends_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("health_log.jsonl");
        let up = Arc::new(AtomicBool::new(false));
        let monitor = HealthMonitor::new(
            vec![Arc::new(Toggle { up: up.clone() })],
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .with_log(log.clone());
        let handle = monitor.handle();

        monitor.tick().await;
        assert!(!handle.status(Component::Database).unwrap().healthy);

        up.store(true, Ordering::SeqCst);
        monitor.tick().await;
        assert!(handle.status(Component::Database).unwrap().healthy);
        assert_eq!(handle.ticks(), 2);

        let lines: Vec<HealthStatus> = crate::store::read_jsonl(&log).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(!lines[0].healthy);
        assert!(lines[1].healthy);
    }

    #[tokio::test]
    async fn test_stuck_check_times_out_as_unhealthy() {
        let monitor = HealthMonitor::new(
            vec![Arc::new(Stuck)],
            Duration::from_secs(60),
            Duration::from_millis(50),
        );
        let statuses = monitor.tick().await;
        assert_eq!(statuses.len(), 1);
        assert!(!statuses[0].healthy);
        assert!(statuses[0].error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_request_check_wakes_loop_early() {
        let up = Arc::new(AtomicBool::new(true));
        let monitor = HealthMonitor::new(
            vec![Arc::new(Toggle { up })],
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );
        let (handle, task) = monitor.spawn();

        for _ in 0..100 {
            if handle.ticks() >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.request_check();
        for _ in 0..100 {
            if handle.ticks() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.ticks() >= 2);

        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
