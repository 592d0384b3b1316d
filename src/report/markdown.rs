use super::RunReport;
use std::fmt::Write;

pub(super) fn render(report: &RunReport) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = write_report(&mut out, report);
    out
}

fn write_report(out: &mut String, r: &RunReport) -> std::fmt::Result {
    writeln!(out, "# Soak run report")?;
    writeln!(out)?;
    if let Some(run_id) = r.run_id {
        writeln!(out, "- Run: `{}`", run_id)?;
    }
    writeln!(out, "- Generated: {}", r.generated_at.to_rfc3339())?;
    match (r.planned_cycles, r.last_checkpoint) {
        (Some(planned), Some(cp)) => writeln!(out, "- Checkpoint: cycle {} of {}", cp, planned)?,
        (Some(planned), None) => writeln!(out, "- Checkpoint: none ({} cycles planned)", planned)?,
        (None, Some(cp)) => writeln!(out, "- Checkpoint: cycle {}", cp)?,
        (None, None) => writeln!(out, "- Checkpoint: none")?,
    }
    writeln!(out)?;

    writeln!(out, "## Pipeline results")?;
    writeln!(out)?;
    writeln!(out, "| Metric | Value |")?;
    writeln!(out, "|---|---|")?;
    writeln!(out, "| Completed cycles | {} |", r.completed)?;
    writeln!(out, "| Successful | {} |", r.successful)?;
    writeln!(out, "| Failed | {} |", r.failed)?;
    writeln!(out, "| Success rate | {:.1}% |", r.success_rate * 100.0)?;
    writeln!(
        out,
        "| Mean cycle duration | {:.1}s |",
        r.mean_cycle_duration.as_secs_f64()
    )?;
    writeln!(out, "| Attempts | {} ({} cycles retried) |", r.total_attempts, r.retried_cycles)?;
    if let Some(scores) = &r.scores {
        writeln!(
            out,
            "| Score (n={}) | min {:.1} / mean {:.2} / max {:.1} |",
            scores.count, scores.min, scores.mean, scores.max
        )?;
    }
    writeln!(out)?;

    if !r.error_kinds.is_empty() {
        writeln!(out, "### Failures by kind")?;
        writeln!(out)?;
        for (kind, count) in &r.error_kinds {
            writeln!(out, "- {}: {}", kind, count)?;
        }
        writeln!(out)?;
    }

    if !r.stage_attempts.is_empty() {
        writeln!(out, "### Stages")?;
        writeln!(out)?;
        writeln!(out, "| Stage | Completed | Failed at |")?;
        writeln!(out, "|---|---|---|")?;
        for (stage, counts) in &r.stage_attempts {
            writeln!(out, "| {} | {} | {} |", stage, counts.completed, counts.failed_at)?;
        }
        writeln!(out)?;
    }

    if !r.failures.is_empty() {
        writeln!(out, "### Failed cycles")?;
        writeln!(out)?;
        for failure in &r.failures {
            let kind = failure.kind.map(|k| k.as_str()).unwrap_or("unknown");
            writeln!(
                out,
                "- cycle {} ({}, {} attempts): {}",
                failure.cycle, kind, failure.attempts, failure.error
            )?;
        }
        writeln!(out)?;
    }

    writeln!(out, "## Harness health")?;
    writeln!(out)?;
    if !r.harness_was_flaky() {
        writeln!(out, "No unhealthy dependencies and no repairs.")?;
        writeln!(out)?;
    }
    if !r.unhealthy_ticks.is_empty() {
        writeln!(out, "| Component | Unhealthy checks |")?;
        writeln!(out, "|---|---|")?;
        for (component, ticks) in &r.unhealthy_ticks {
            writeln!(out, "| {} | {} |", component, ticks)?;
        }
        writeln!(out)?;
    }
    if r.repairs.total > 0 {
        writeln!(
            out,
            "Repairs: {} attempted, {} succeeded.",
            r.repairs.total, r.repairs.successes
        )?;
        writeln!(out)?;
        writeln!(out, "| Component | Attempts | Succeeded | Mean duration |")?;
        writeln!(out, "|---|---|---|---|")?;
        for (component, stats) in &r.repairs.by_component {
            writeln!(
                out,
                "| {} | {} | {} | {:.0}ms |",
                component, stats.attempts, stats.successes, stats.mean_duration_ms
            )?;
        }
        writeln!(out)?;
    }

    writeln!(out, "## Artifact integrity")?;
    writeln!(out)?;
    let clean = r.integrity_mismatches.is_empty()
        && r.missing_cycles.is_empty()
        && r.duplicate_cycles.is_empty()
        && r.incomplete.is_empty();
    if clean {
        writeln!(out, "All cycle directories present once and matching their manifests.")?;
    }
    if !r.missing_cycles.is_empty() {
        writeln!(out, "- Missing cycles: {}", join(&r.missing_cycles))?;
    }
    if !r.duplicate_cycles.is_empty() {
        writeln!(out, "- Duplicate cycles: {}", join(&r.duplicate_cycles))?;
    }
    if !r.incomplete.is_empty() {
        writeln!(out, "- Interrupted cycles (no result): {}", join(&r.incomplete))?;
    }
    for file in &r.integrity_mismatches {
        writeln!(out, "- Modified after write: `{}`", file)?;
    }
    Ok(())
}

fn join(indices: &[u32]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
