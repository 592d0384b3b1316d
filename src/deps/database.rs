use crate::cycle::CycleResult;
use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Async-safe handle to the run's sqlite result index.
///
/// Wraps the connection behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
pub struct DatabaseHandle {
    path: PathBuf,
    conn: Arc<std::sync::Mutex<Connection>>,
}

impl DatabaseHandle {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        migrate(&conn).context("Failed to run migrations")?;
        Ok(Self {
            path: path.to_path_buf(),
            conn: Arc::new(std::sync::Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a closure with access to the connection on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Round trip a trivial query; returns the latency.
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        self.call(|conn| {
            let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
            anyhow::ensure!(one == 1, "SELECT 1 returned {}", one);
            Ok(())
        })
        .await?;
        Ok(start.elapsed())
    }

    /// `PRAGMA quick_check`; returns the first problem reported, if any.
    pub async fn integrity_problem(&self) -> Result<Option<String>> {
        self.call(|conn| {
            let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
            Ok((verdict != "ok").then_some(verdict))
        })
        .await
    }

    /// Mirror a cycle result into the index. Re-running a cycle replaces its row.
    pub async fn record_cycle(&self, run_id: Uuid, result: &CycleResult) -> Result<()> {
        let run_id = run_id.to_string();
        let result = result.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cycle_results
                    (run_id, cycle, success, duration_ms, score, error_kind, error, attempts, finished_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    run_id,
                    result.index,
                    result.success,
                    result.duration.as_millis() as i64,
                    result.score,
                    result.error_kind.map(|k| k.as_str()),
                    result.error,
                    result.attempts,
                    result.finished_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cycle_results (
            run_id TEXT NOT NULL,
            cycle INTEGER NOT NULL,
            success INTEGER NOT NULL,
            duration_ms INTEGER NOT NULL,
            score REAL,
            error_kind TEXT,
            error TEXT,
            attempts INTEGER NOT NULL,
            finished_at TEXT NOT NULL,
            PRIMARY KEY (run_id, cycle)
        );",
    )?;
    Ok(())
}
