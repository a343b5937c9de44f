//! Live progress lines driven by executor events.

use console::style;
use tokio::sync::mpsc;

use crate::dag::{PhaseEvent, PhaseStatus};

use super::icons::{CHECK, CLOCK, CROSS, RUNNING, SKIP, WAVE};
use super::report::format_duration;

/// Prints one line per executor event to stderr.
pub struct EventPrinter {
    rx: mpsc::UnboundedReceiver<PhaseEvent>,
}

impl EventPrinter {
    pub fn new(rx: mpsc::UnboundedReceiver<PhaseEvent>) -> Self {
        Self { rx }
    }

    /// Drain events until every sender is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            eprintln!("{}", render(&event));
        }
    }
}

/// Single-line rendering of an event.
pub fn render(event: &PhaseEvent) -> String {
    match event {
        PhaseEvent::WaveStarted { wave, phases } => format!(
            "\n{}{} {} {}",
            WAVE,
            style("Wave").bold(),
            style(wave).yellow().bold(),
            style(phases.join(", ")).dim()
        ),
        PhaseEvent::Started {
            phase, attempt, ..
        } => {
            let attempt = if *attempt > 1 {
                format!(" (attempt {})", attempt)
            } else {
                String::new()
            };
            format!("  {}{}{}", RUNNING, style(phase).cyan(), style(attempt).dim())
        }
        PhaseEvent::Completed { phase, run } => {
            let elapsed = style(format_duration(run.duration)).dim();
            match run.status {
                PhaseStatus::Succeeded => {
                    format!("  {}{} {}", CHECK, style(phase).green().bold(), elapsed)
                }
                PhaseStatus::TimedOut => format!(
                    "  {}{} {} {}",
                    CLOCK,
                    style(phase).red().bold(),
                    style("timed out").red(),
                    elapsed
                ),
                PhaseStatus::Skipped => format!(
                    "  {}{} {}",
                    SKIP,
                    style(phase).yellow(),
                    style(run.error.as_deref().unwrap_or("skipped")).dim()
                ),
                _ => format!(
                    "  {}{} {} {}",
                    CROSS,
                    style(phase).red().bold(),
                    style(run.error.as_deref().unwrap_or("failed")).red(),
                    elapsed
                ),
            }
        }
        PhaseEvent::WaveCompleted {
            wave,
            succeeded,
            failed,
        } => format!(
            "  {} wave {}: {} succeeded, {} failed",
            style("└").dim(),
            wave,
            style(succeeded).green(),
            style(failed).red()
        ),
    }
}
