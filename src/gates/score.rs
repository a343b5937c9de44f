//! Score extraction from generated artifacts.

use regex::Regex;
use std::sync::LazyLock;

/// Maximum value on the quality scale.
pub const MAX_SCORE: u8 = 10;

static SCORE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)score:\s*(\d+)/10").expect("score pattern is a valid regex")
});

/// Extract the quality score from an artifact.
///
/// The last `Score: N/10` marker wins, so a reviewer's final verdict overrides any
/// earlier quoted scores. No marker, an unparseable number, or a value above 10
/// scores 0.
pub fn score(artifact: &str) -> u8 {
    SCORE_PATTERN
        .captures_iter(artifact)
        .last()
        .and_then(|caps| caps[1].parse::<u8>().ok())
        .filter(|&value| value <= MAX_SCORE)
        .unwrap_or(0)
}

/// Whether a score meets a threshold.
pub fn passes(score: u8, threshold: u8) -> bool {
    score >= threshold
}
