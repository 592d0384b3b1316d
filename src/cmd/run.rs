use crate::{Cli, RunArgs};
use anyhow::{Context, Result};
use soak::config::{Overrides, SoakToml};
use soak::logging;
use soak::orchestrator::runner::cancel_on_ctrl_c;
use soak::orchestrator::{Orchestrator, RunSummary, StopReason};
use soak::report::REPORT_MARKDOWN_FILE;

/// `soak run` and `soak resume`.
pub async fn cmd_run(cli: &Cli, args: &RunArgs, resume: bool) -> Result<()> {
    let overrides = Overrides {
        cycles: args.cycles,
        artifact_dir: args.artifact_dir.clone(),
    };
    let config = SoakToml::load(&args.config, &overrides)
        .with_context(|| format!("Invalid configuration in {}", args.config.display()))?;

    let run_dir = config.run.artifact_dir.clone();
    let _guard = logging::init(Some(&run_dir), cli.log_json, cli.verbose)?;

    let orchestrator = Orchestrator::new(config);
    cancel_on_ctrl_c(orchestrator.cancel_token());

    let summary = orchestrator.run(resume).await?;
    print_summary(&summary, &run_dir.join(REPORT_MARKDOWN_FILE));
    Ok(())
}

fn print_summary(summary: &RunSummary, report: &std::path::Path) {
    println!();
    println!("Run {}", summary.run_id);
    println!(
        "  cycles {}..{} of {}: {} attempted, {} succeeded, {} failed",
        summary.start_cycle,
        summary.start_cycle + summary.attempted.saturating_sub(1),
        summary.total_cycles,
        summary.attempted,
        summary.successful,
        summary.failed
    );
    for (kind, count) in &summary.error_kinds {
        println!("    {}: {}", kind, count);
    }
    if summary.attempted > 0 {
        println!(
            "  success rate: {:.1}%, mean cycle {:.1}s",
            summary.success_rate * 100.0,
            summary.mean_cycle_duration.as_secs_f64()
        );
    }
    if let Some(score) = summary.mean_score {
        println!("  mean score: {:.2}", score);
    }
    if summary.repairs.total > 0 {
        println!(
            "  repairs: {} attempted, {} succeeded",
            summary.repairs.total, summary.repairs.successes
        );
    }
    println!("  checkpoint: cycle {}", summary.last_checkpoint);
    match summary.stop_reason {
        StopReason::Completed => {}
        StopReason::BudgetExhausted => {
            println!("  stopped: wall-clock budget exhausted (use `soak resume` to continue)")
        }
        StopReason::Cancelled => println!("  stopped: interrupted (use `soak resume` to continue)"),
    }
    println!("  artifacts: {}", summary.artifact_dir.display());
    if report.exists() {
        println!("  report: {}", report.display());
    }
}
