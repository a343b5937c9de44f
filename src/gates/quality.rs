//! Quality gate evaluation with bounded regeneration.
//!
//! A gated phase's artifact is scored; below-threshold artifacts are regenerated and
//! re-scored until the attempt budget runs out, at which point a policy picks the
//! final disposition. The loop is an explicit state machine:
//!
//! ```text
//! Scoring(n) ──pass──────────────► Passed ──► Decided
//!     │ fail, n < max                               ▲
//!     ▼                                             │
//! Regenerating(n+1) ──► Scoring(n+1)                │
//!     │ fail, n == max                              │
//!     ▼                                             │
//! Exhausted ──policy──────────────────────────────►─┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use super::score::{passes, score};
use crate::dag::PhaseRun;
use crate::errors::WorkflowError;
use crate::manifest::{ManifestEntry, ManifestHandle, QualityRecord};
use crate::phase::Phase;

/// Default passing score on the 0-10 scale.
pub const DEFAULT_THRESHOLD: u8 = 8;
/// Default number of scored attempts, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Recorded outcome of a gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Score met the threshold
    Passed,
    /// Exhausted, but the artifact is kept and reported
    AcceptWithWarning,
    /// Exhausted; re-run only the gated phase
    RegeneratePartial,
    /// Exhausted; re-run the whole wave the phase belongs to
    RegenerateSegment,
    /// Exhausted; stop the workflow
    Abort,
}

impl GateDecision {
    /// Whether the artifact is accepted as the phase's output.
    pub fn accepts(&self) -> bool {
        matches!(self, Self::Passed | Self::AcceptWithWarning)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::AcceptWithWarning => "accept_with_warning",
            Self::RegeneratePartial => "regenerate_partial",
            Self::RegenerateSegment => "regenerate_segment",
            Self::Abort => "abort",
        }
    }
}

impl std::fmt::Display for GateDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final disposition once the attempt budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityDisposition {
    #[default]
    Abort,
    AcceptWithWarning,
    RegeneratePartial,
    RegenerateSegment,
}

impl QualityDisposition {
    pub fn is_regeneration(&self) -> bool {
        matches!(self, Self::RegeneratePartial | Self::RegenerateSegment)
    }
}

impl From<QualityDisposition> for GateDecision {
    fn from(disposition: QualityDisposition) -> Self {
        match disposition {
            QualityDisposition::Abort => GateDecision::Abort,
            QualityDisposition::AcceptWithWarning => GateDecision::AcceptWithWarning,
            QualityDisposition::RegeneratePartial => GateDecision::RegeneratePartial,
            QualityDisposition::RegenerateSegment => GateDecision::RegenerateSegment,
        }
    }
}

impl std::fmt::Display for QualityDisposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", GateDecision::from(*self))
    }
}

impl std::str::FromStr for QualityDisposition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "abort" => Ok(Self::Abort),
            "accept_with_warning" | "accept" => Ok(Self::AcceptWithWarning),
            "regenerate_partial" | "partial" => Ok(Self::RegeneratePartial),
            "regenerate_segment" | "segment" => Ok(Self::RegenerateSegment),
            _ => anyhow::bail!(
                "Invalid quality disposition '{}'. Valid values: abort, accept_with_warning, regenerate_partial, regenerate_segment",
                s
            ),
        }
    }
}

/// One scoring of a gated artifact. Lives only until the gate's decision is logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityScore {
    pub phase_id: String,
    pub value: u8,
    pub threshold: u8,
    pub attempt: u32,
    pub max_attempts: u32,
}

impl QualityScore {
    pub fn passes(&self) -> bool {
        passes(self.value, self.threshold)
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    pub fn record(&self, decision: GateDecision) -> QualityRecord {
        QualityRecord {
            score: self.value,
            threshold: self.threshold,
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            decision,
        }
    }
}

/// Caller-supplied disposition for an exhausted gate.
pub trait QualityPolicy: Send + Sync {
    /// Decide what to do with an artifact that never reached the threshold.
    /// `regenerations_used` counts post-exhaustion regenerations already spent in this run.
    fn decide(&self, score: &QualityScore, regenerations_used: u32) -> QualityDisposition;
}

/// Policy backed by the `[quality]` configuration section.
#[derive(Debug, Clone, Copy)]
pub struct ConfiguredPolicy {
    pub disposition: QualityDisposition,
    pub max_regenerations: u32,
}

impl QualityPolicy for ConfiguredPolicy {
    fn decide(&self, score: &QualityScore, regenerations_used: u32) -> QualityDisposition {
        if self.disposition.is_regeneration() && regenerations_used >= self.max_regenerations {
            tracing::warn!(
                phase = %score.phase_id,
                used = regenerations_used,
                max = self.max_regenerations,
                "Regeneration budget spent; aborting instead"
            );
            return QualityDisposition::Abort;
        }
        self.disposition
    }
}

/// Produces a fresh artifact for a gated phase.
#[async_trait]
pub trait Regenerate: Send + Sync {
    /// Re-run the phase (or its designated sub-command) for gate attempt `attempt`.
    /// `Ok(None)` means the re-run did not produce a usable artifact, which scores 0.
    async fn regenerate(&self, phase: &Phase, attempt: u32) -> Result<Option<String>, WorkflowError>;
}

/// States of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Scoring { attempt: u32 },
    Regenerating { attempt: u32 },
    Passed(QualityScore),
    Exhausted(QualityScore),
    Decided {
        score: QualityScore,
        decision: GateDecision,
    },
}

/// Final result of a gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    pub score: QualityScore,
    pub decision: GateDecision,
}

impl GateOutcome {
    pub fn phase_id(&self) -> &str {
        &self.score.phase_id
    }

    /// The error an `Abort` decision ends the workflow with.
    pub fn threshold_error(&self) -> Option<WorkflowError> {
        (self.decision == GateDecision::Abort).then(|| WorkflowError::QualityThreshold {
            phase: self.score.phase_id.clone(),
            score: self.score.value,
            threshold: self.score.threshold,
            attempts: self.score.attempt,
        })
    }

    /// Human-readable reason stored with the manifest entry.
    pub fn reason(&self) -> String {
        let s = &self.score;
        match self.decision {
            GateDecision::Passed => format!(
                "score {}/10 meets threshold {} on attempt {}",
                s.value, s.threshold, s.attempt
            ),
            decision => format!(
                "score {}/10 below threshold {} after {} attempt(s); {}",
                s.value, s.threshold, s.attempt, decision
            ),
        }
    }
}

/// Threshold gate for quality-gated phases.
#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    pub threshold: u8,
    pub max_attempts: u32,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl QualityGate {
    pub fn new(threshold: u8, max_attempts: u32) -> Self {
        Self {
            threshold,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Score an artifact without regeneration.
    pub fn check(&self, phase_id: &str, artifact: &str) -> QualityScore {
        QualityScore {
            phase_id: phase_id.to_string(),
            value: score(artifact),
            threshold: self.threshold,
            attempt: 1,
            max_attempts: self.max_attempts,
        }
    }

    /// Drive the gate to a decision and record it in the manifest.
    ///
    /// The policy is consulted at most once, and only when every attempt scored below
    /// the threshold. `regenerations` is the run-wide count of post-exhaustion
    /// regenerations; a regenerate decision reserves one before returning.
    #[allow(clippy::too_many_arguments)]
    #[tracing::instrument(name = "quality_gate", skip_all, fields(phase = %phase.id))]
    pub async fn evaluate(
        &self,
        phase: &Phase,
        wave: usize,
        artifact: Option<String>,
        regenerator: &dyn Regenerate,
        policy: &dyn QualityPolicy,
        regenerations: &AtomicU32,
        manifest: &ManifestHandle,
    ) -> Result<GateOutcome, WorkflowError> {
        let mut artifact = artifact;
        let mut state = GateState::Scoring { attempt: 1 };

        let outcome = loop {
            state = match state {
                GateState::Scoring { attempt } => {
                    let scored = QualityScore {
                        phase_id: phase.id.clone(),
                        value: artifact.as_deref().map_or(0, score),
                        threshold: self.threshold,
                        attempt,
                        max_attempts: self.max_attempts,
                    };
                    tracing::info!(
                        score = scored.value,
                        threshold = scored.threshold,
                        attempt,
                        "Scored artifact"
                    );
                    if scored.passes() {
                        GateState::Passed(scored)
                    } else if scored.exhausted() {
                        GateState::Exhausted(scored)
                    } else {
                        GateState::Regenerating {
                            attempt: attempt + 1,
                        }
                    }
                }
                GateState::Regenerating { attempt } => {
                    tracing::info!(attempt, "Regenerating below-threshold artifact");
                    artifact = regenerator.regenerate(phase, attempt).await?;
                    GateState::Scoring { attempt }
                }
                GateState::Passed(scored) => GateState::Decided {
                    score: scored,
                    decision: GateDecision::Passed,
                },
                GateState::Exhausted(scored) => {
                    let used = regenerations.load(Ordering::SeqCst);
                    let decision: GateDecision = policy.decide(&scored, used).into();
                    if matches!(
                        decision,
                        GateDecision::RegeneratePartial | GateDecision::RegenerateSegment
                    ) {
                        regenerations.fetch_add(1, Ordering::SeqCst);
                    }
                    tracing::warn!(score = scored.value, %decision, "Quality attempts exhausted");
                    GateState::Decided {
                        score: scored,
                        decision,
                    }
                }
                GateState::Decided { score, decision } => break GateOutcome { score, decision },
            };
        };

        manifest
            .append(ManifestEntry::quality(
                &phase.id,
                wave,
                outcome.score.record(outcome.decision),
                &outcome.reason(),
            ))
            .await?;

        Ok(outcome)
    }
}

/// Read the artifact a gated phase produced.
///
/// Uses the phase's declared artifact path (relative to its working directory) or,
/// when none is declared, the run's captured stdout. Read failures are logged and
/// yield `None`, which the gate scores as 0.
pub async fn load_artifact(phase: &Phase, run: &PhaseRun, base_dir: &Path) -> Option<String> {
    let path = match (&phase.artifact, &run.output) {
        (Some(artifact), _) => phase.command.resolve_working_dir(base_dir).join(artifact),
        (None, Some(output)) => output.stdout.clone(),
        (None, None) => return None,
    };
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => Some(content),
        Err(e) => {
            tracing::warn!(phase = %phase.id, path = %path.display(), error = %e, "Failed to read artifact");
            None
        }
    }
}
