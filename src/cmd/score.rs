//! Stand-alone quality scoring of an artifact file.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use phaseflow::config::OrchestratorConfig;
use phaseflow::gates::{MAX_SCORE, passes, score};
use phaseflow::ui::icons::{CHECK, CROSS};

/// Prints the score found in `file`. Exit code 0 when it meets the threshold, 1 otherwise.
pub fn cmd_score(config: &OrchestratorConfig, file: &Path, threshold: Option<u8>) -> Result<i32> {
    let threshold = threshold.unwrap_or(config.quality.threshold);
    if threshold > MAX_SCORE {
        anyhow::bail!("Threshold must be between 0 and {}, got {}", MAX_SCORE, threshold);
    }
    let artifact = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read artifact: {}", file.display()))?;

    let value = score(&artifact);
    if passes(value, threshold) {
        println!(
            "{}Score {}/{} meets threshold {}",
            CHECK,
            style(value).green().bold(),
            MAX_SCORE,
            threshold
        );
        Ok(0)
    } else {
        println!(
            "{}Score {}/{} below threshold {}",
            CROSS,
            style(value).red().bold(),
            MAX_SCORE,
            threshold
        );
        Ok(1)
    }
}
