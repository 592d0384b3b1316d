use crate::Cli;
use anyhow::{Context, Result};
use soak::health::{Component, HEALTH_LOG_FILE, HealthStatus};
use soak::logging;
use soak::orchestrator::{RunMetadata, RunSummary};
use soak::report::ReportAggregator;
use soak::store::{ArtifactStore, CheckpointStore, read_jsonl};
use std::collections::BTreeMap;
use std::path::Path;

/// `soak status`: read-only view of a run directory. Safe while a run is live.
pub fn cmd_status(cli: &Cli, dir: &Path) -> Result<()> {
    let _guard = logging::init(None, cli.log_json, cli.verbose)?;
    if !dir.is_dir() {
        anyhow::bail!("{} is not a run directory", dir.display());
    }

    match RunMetadata::load(dir) {
        Some(meta) => {
            println!("Run {} (seed {})", meta.run_id, meta.seed);
            println!("  started:  {}", meta.started_at.to_rfc3339());
            if let Some(last) = meta.resumed_at.last() {
                println!("  resumed:  {} ({} times)", last.to_rfc3339(), meta.resumed_at.len());
            }
            println!("  stages:   {}", meta.stages.join(" -> "));
            println!("  planned:  {} cycles", meta.cycles);
        }
        None => println!("No run.json in {}", dir.display()),
    }

    match CheckpointStore::new(dir).load() {
        Some(cp) => println!(
            "  checkpoint: cycle {} at {}",
            cp.last_completed_cycle,
            cp.timestamp.to_rfc3339()
        ),
        None => println!("  checkpoint: none"),
    }

    let store = ArtifactStore::new(dir);
    let (mut succeeded, mut failed, mut partial) = (0u32, 0u32, Vec::new());
    for record in store.read_all().context("Failed to read cycle directories")? {
        match &record.result {
            Some(result) if result.success => succeeded += 1,
            Some(_) => failed += 1,
            None => partial.push(record.index),
        }
    }
    println!("  cycles:   {} succeeded, {} failed", succeeded, failed);
    if !partial.is_empty() {
        let list: Vec<String> = partial.iter().map(|i| i.to_string()).collect();
        println!("  partial:  {}", list.join(", "));
    }

    let health: Vec<HealthStatus> = read_jsonl(&dir.join(HEALTH_LOG_FILE)).unwrap_or_default();
    let mut latest: BTreeMap<Component, &HealthStatus> = BTreeMap::new();
    for status in &health {
        latest.insert(status.component, status);
    }
    if !latest.is_empty() {
        println!("  health:");
        for (component, status) in latest {
            let state = if status.healthy { "ok" } else { "UNHEALTHY" };
            match &status.error {
                Some(err) if !status.healthy => println!("    {:<16} {} ({})", component.as_str(), state, err),
                _ => println!("    {:<16} {}", component.as_str(), state),
            }
        }
    }

    if let Some(summary) = RunSummary::load(dir) {
        println!(
            "  last process: {} ({} of {} attempted cycles succeeded)",
            summary.stop_reason, summary.successful, summary.attempted
        );
    }
    Ok(())
}

/// `soak report`: rebuild the report files and print one of them.
pub fn cmd_report(cli: &Cli, dir: &Path, json: bool) -> Result<()> {
    let _guard = logging::init(None, cli.log_json, cli.verbose)?;
    let report = ReportAggregator::new(dir).build()?;
    report.write(dir)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_markdown());
    }
    Ok(())
}
