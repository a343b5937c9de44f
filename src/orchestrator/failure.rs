//! Failure handling policy: retry, skip or abort a failed phase.
//!
//! | condition                                        | action                         |
//! |--------------------------------------------------|--------------------------------|
//! | fail-fast enabled                                | abort, no retries              |
//! | workflow cancelled                               | abort                          |
//! | timed out, attempts remain                       | retry with the same timeout    |
//! | failed, `retryable`, attempts remain             | retry                          |
//! | attempts exhausted (or not retryable)            | `on_exhausted`: skip or abort  |

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dag::{FailureClass, PhaseRun, PhaseStatus};
use crate::phase::Phase;

/// What to do with a phase that has no retries left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustedAction {
    /// Mark the phase skipped and report the wave as a partial success
    #[default]
    Skip,
    /// Stop the workflow after the current wave
    Abort,
}

impl std::fmt::Display for ExhaustedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExhaustedAction::Skip => write!(f, "skip"),
            ExhaustedAction::Abort => write!(f, "abort"),
        }
    }
}

impl std::str::FromStr for ExhaustedAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(ExhaustedAction::Skip),
            "abort" => Ok(ExhaustedAction::Abort),
            _ => anyhow::bail!("Invalid failure action '{}'. Valid values: skip, abort", s),
        }
    }
}

/// Retry budget and backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per phase, including the first
    pub max_attempts: u32,
    /// Cap on retries across the whole run
    pub workflow_budget: Option<u32>,
    pub backoff: Duration,
    pub max_backoff: Duration,
    pub on_exhausted: ExhaustedAction,
    pub fail_fast: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            workflow_budget: None,
            backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
            on_exhausted: ExhaustedAction::Skip,
            fail_fast: false,
        }
    }
}

impl RetryPolicy {
    /// Delay before relaunching after the given failed attempt: `backoff * 2^(attempt-1)`,
    /// capped at `max_backoff`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Decision for one failed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    Retry { delay: Duration },
    Skip { reason: String },
    Abort { reason: String },
}

/// Stateful failure handler for one workflow run. Tracks the run-wide retry budget.
#[derive(Debug)]
pub struct FailureHandler {
    policy: RetryPolicy,
    retries_used: u32,
}

impl FailureHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retries_used: 0,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn retries_used(&self) -> u32 {
        self.retries_used
    }

    /// Decide what happens after `run` failed. `attempts_made` counts the attempts in
    /// the current execution round, including `run`.
    pub fn decide(&mut self, phase: &Phase, run: &PhaseRun, attempts_made: u32) -> FailureAction {
        let class = run.failure.unwrap_or(FailureClass::Application);

        if run.is_cancelled() {
            return FailureAction::Abort {
                reason: "workflow cancelled".to_string(),
            };
        }
        if self.policy.fail_fast {
            return FailureAction::Abort {
                reason: format!("fail-fast: {} failure", class),
            };
        }

        let max_attempts = phase.max_attempts.unwrap_or(self.policy.max_attempts);
        let eligible = match run.status {
            PhaseStatus::TimedOut => true,
            _ => phase.retryable,
        };
        let attempts_remain = attempts_made < max_attempts;
        let budget_remains = self
            .policy
            .workflow_budget
            .is_none_or(|budget| self.retries_used < budget);

        if eligible && attempts_remain && budget_remains {
            self.retries_used += 1;
            let delay = self.policy.backoff_delay(attempts_made);
            tracing::info!(
                phase = %phase.id,
                %class,
                attempt = attempts_made,
                delay_ms = delay.as_millis() as u64,
                "Retrying failed phase"
            );
            return FailureAction::Retry { delay };
        }

        let reason = if !eligible {
            format!("{} failure, phase is not retryable", class)
        } else if !attempts_remain {
            format!("{} failure after {} attempt(s)", class, attempts_made)
        } else {
            format!("{} failure, workflow retry budget spent", class)
        };

        match self.policy.on_exhausted {
            ExhaustedAction::Skip => FailureAction::Skip { reason },
            ExhaustedAction::Abort => FailureAction::Abort { reason },
        }
    }
}
