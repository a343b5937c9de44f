//! Plan listing, manifest status table and the end-of-run summary.

use console::style;
use std::fmt::Write;
use std::time::Duration;

use crate::dag::ExecutionPlan;
use crate::manifest::{ManifestReplay, ManifestStatus};
use crate::orchestrator::{PhaseSummary, WorkflowOutcome, WorkflowResult};
use crate::phase::PhaseRegistry;

use super::icons::{CHECK, CROSS, MANIFEST, WARN, WAVE};

/// `1h 02m`, `3m 07s`, `4.2s`.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

fn styled_status(status: Option<ManifestStatus>) -> String {
    let label = status.map(|s| s.as_str()).unwrap_or("not run");
    let padded = format!("{:<8}", label);
    match status {
        Some(ManifestStatus::Success) => style(padded).green().to_string(),
        Some(ManifestStatus::Failed | ManifestStatus::Timeout) => style(padded).red().to_string(),
        Some(ManifestStatus::Skipped) => style(padded).yellow().to_string(),
        _ => style(padded).dim().to_string(),
    }
}

pub fn render_plan(plan: &ExecutionPlan, registry: &PhaseRegistry) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} phases in {} waves",
        style(plan.phase_count()).bold(),
        style(plan.len()).bold()
    );
    for wave in &plan.waves {
        let _ = writeln!(out, "\n{}{} {}", WAVE, style("Wave").bold(), style(wave.index).yellow().bold());
        for id in &wave.phases {
            let Some(phase) = registry.get(id) else {
                continue;
            };
            let deps = if phase.dependencies.is_empty() {
                String::new()
            } else {
                format!(" <- {}", phase.dependencies.join(", "))
            };
            let gated = if phase.quality_gated { " [gated]" } else { "" };
            let _ = writeln!(
                out,
                "  {:<20}{}{}  {}",
                style(id).cyan(),
                style(deps).dim(),
                style(gated).magenta(),
                style(phase.command.display()).dim()
            );
        }
    }
    out
}

pub fn print_plan(plan: &ExecutionPlan, registry: &PhaseRegistry) {
    println!();
    print!("{}", render_plan(plan, registry));
    println!();
}

fn phase_row(s: &PhaseSummary) -> String {
    let exit = s.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".into());
    let duration = s
        .duration_seconds
        .map(|d| format_duration(Duration::from_secs_f64(d.max(0.0))))
        .unwrap_or_else(|| "-".into());
    let mut detail = match (&s.failure, &s.reason) {
        (_, Some(reason)) => reason.clone(),
        (Some(class), None) => class.to_string(),
        _ => String::new(),
    };
    if let Some((score, decision)) = s.quality {
        detail = format!("quality {}/10 {}", score, decision);
    }
    format!(
        "  {:<20} {} {:>5} {:>8} {:>4}  {}",
        s.phase,
        styled_status(s.status),
        exit,
        duration,
        s.attempts,
        style(detail).dim()
    )
}

pub fn render_report(result: &WorkflowResult) -> String {
    let mut out = String::new();
    let headline = match &result.outcome {
        WorkflowOutcome::Completed => format!("{}{}", CHECK, style(result.outcome.label()).green().bold()),
        WorkflowOutcome::CompletedPartial => {
            format!("{}{}", WARN, style(result.outcome.label()).yellow().bold())
        }
        WorkflowOutcome::Aborted { reason } => format!(
            "{}{}: {}",
            CROSS,
            style(result.outcome.label()).red().bold(),
            reason
        ),
    };
    let _ = writeln!(out, "{}", headline);
    let _ = writeln!(
        out,
        "Run {} · {} waves · {} succeeded, {} failed, {} skipped · {}",
        style(&result.run_id).cyan(),
        result.waves_completed,
        style(result.phases_succeeded).green(),
        style(result.phases_failed).red(),
        style(result.phases_skipped).yellow(),
        format_duration(result.total_duration)
    );
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "  {:<20} {:<8} {:>5} {:>8} {:>4}  Detail",
        "Phase", "Status", "Exit", "Time", "Runs"
    );
    for summary in &result.phases {
        let _ = writeln!(out, "{}", phase_row(summary));
    }
    for warning in &result.quality_warnings {
        let _ = writeln!(out, "{}{}", WARN, style(warning).yellow());
    }
    let _ = writeln!(out, "\n{}{}", MANIFEST, style(result.manifest_path.display()).dim());
    out
}

pub fn print_report(result: &WorkflowResult) {
    println!();
    print!("{}", render_report(result));
    println!();
}

/// Latest status of every phase in a replayed manifest, in order of first appearance.
pub fn render_status(run_id: &str, replay: &ManifestReplay) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Run {}", style(run_id).cyan().bold());
    let _ = writeln!(
        out,
        "  {:<20} {:<8} {:>5} {:>8} {:>4}  Detail",
        "Phase", "Status", "Exit", "Time", "Runs"
    );
    for entry in replay.latest_entries() {
        let _ = writeln!(out, "{}", phase_row(&PhaseSummary::from_replay(replay, &entry.phase)));
    }
    if replay.skipped_lines > 0 {
        let _ = writeln!(
            out,
            "{}{}",
            WARN,
            style(format!("{} unparseable manifest line(s) ignored", replay.skipped_lines)).yellow()
        );
    }
    out
}

pub fn print_status(run_id: &str, replay: &ManifestReplay) {
    println!();
    print!("{}", render_status(run_id, replay));
    println!();
}
