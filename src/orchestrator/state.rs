//! Workflow state machine and the terminal result of a run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::dag::FailureClass;
use crate::errors::WorkflowError;
use crate::gates::GateDecision;
use crate::manifest::{ManifestReplay, ManifestStatus};
use crate::phase::PhaseRegistry;

/// Driver state over the wave sequence.
///
/// `Idle → WaveRunning(k) → WaveEvaluated(k) → {WaveRunning(k+1) | Completed | Aborted}`.
/// A segment regeneration re-enters `WaveRunning(k)` from `WaveEvaluated(k)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowState {
    #[default]
    Idle,
    WaveRunning(usize),
    WaveEvaluated(usize),
    Completed,
    Aborted,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        match (*self, next) {
            (_, Aborted) => !self.is_terminal(),
            (Idle, WaveRunning(0)) | (Idle, Completed) => true,
            (WaveRunning(k), WaveEvaluated(j)) => k == j,
            (WaveEvaluated(k), WaveRunning(j)) => j == k || j == k + 1,
            (WaveEvaluated(_), Completed) => true,
            _ => false,
        }
    }

    pub fn transition(&mut self, next: WorkflowState) -> Result<(), WorkflowError> {
        if !self.can_transition_to(next) {
            return Err(anyhow::anyhow!("invalid workflow transition {:?} -> {:?}", self, next).into());
        }
        tracing::debug!(from = ?self, to = ?next, "Workflow state transition");
        *self = next;
        Ok(())
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    /// Every phase succeeded
    Completed,
    /// All waves processed, some phases skipped or failed
    CompletedPartial,
    /// A wave-level abort decision stopped the run
    Aborted { reason: String },
}

impl WorkflowOutcome {
    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::CompletedPartial => 2,
            Self::Aborted { .. } => 1,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "Completed",
            Self::CompletedPartial => "Completed (partial)",
            Self::Aborted { .. } => "Aborted",
        }
    }
}

/// Terminal status of one phase, reconstructed from the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase: String,
    /// Latest recorded status; `None` if the phase never appears in the manifest
    pub status: Option<ManifestStatus>,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureClass>,
    pub duration_seconds: Option<f64>,
    /// Process launches recorded for the phase
    pub attempts: u32,
    pub wave: Option<usize>,
    pub reason: Option<String>,
    pub quality: Option<(u8, GateDecision)>,
}

impl PhaseSummary {
    pub fn from_replay(replay: &ManifestReplay, phase: &str) -> Self {
        let latest = replay.latest(phase);
        let process = replay.latest_terminal_run(phase);
        let attempts = replay
            .entries
            .iter()
            .filter(|e| e.phase == phase && e.status == ManifestStatus::Started)
            .count() as u32;
        let quality = replay
            .entries
            .iter()
            .rev()
            .find(|e| e.phase == phase)
            .and_then(|e| e.quality.as_ref())
            .map(|q| (q.score, q.decision));

        Self {
            phase: phase.to_string(),
            status: latest.map(|e| e.status),
            exit_code: process.and_then(|e| e.exit_code),
            failure: process.and_then(|e| e.failure),
            duration_seconds: process.and_then(|e| e.duration_seconds),
            attempts,
            wave: latest.and_then(|e| e.wave),
            reason: latest.and_then(|e| e.reason.clone()),
            quality,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == Some(ManifestStatus::Success)
    }
}

/// Terminal aggregate of a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: String,
    pub outcome: WorkflowOutcome,
    pub waves_completed: usize,
    pub phases_succeeded: usize,
    pub phases_failed: usize,
    pub phases_skipped: usize,
    #[serde(with = "duration_secs_f64")]
    pub total_duration: Duration,
    pub manifest_path: PathBuf,
    pub phases: Vec<PhaseSummary>,
    pub quality_warnings: Vec<String>,
}

impl WorkflowResult {
    /// Build the result by replaying the manifest. Phases are listed in registry order.
    ///
    /// A run that was not aborted is `Completed` only if every phase's latest status
    /// is `success`; otherwise it is `CompletedPartial`.
    pub fn from_replay(
        run_id: &str,
        registry: &PhaseRegistry,
        replay: &ManifestReplay,
        abort_reason: Option<String>,
        waves_completed: usize,
        total_duration: Duration,
        manifest_path: PathBuf,
    ) -> Self {
        let phases: Vec<PhaseSummary> = registry
            .phases()
            .iter()
            .map(|p| PhaseSummary::from_replay(replay, &p.id))
            .collect();

        let count = |pred: fn(&Option<ManifestStatus>) -> bool| {
            phases.iter().filter(|s| pred(&s.status)).count()
        };
        let phases_succeeded = count(|s| *s == Some(ManifestStatus::Success));
        let phases_failed =
            count(|s| matches!(s, Some(ManifestStatus::Failed | ManifestStatus::Timeout)));
        let phases_skipped = count(|s| *s == Some(ManifestStatus::Skipped));

        let quality_warnings = phases
            .iter()
            .filter_map(|s| match s.quality {
                Some((score, GateDecision::AcceptWithWarning)) => Some(format!(
                    "{} accepted with quality score {}/10 below threshold",
                    s.phase, score
                )),
                _ => None,
            })
            .collect();

        let outcome = match abort_reason {
            Some(reason) => WorkflowOutcome::Aborted { reason },
            None if phases.iter().all(PhaseSummary::succeeded) => WorkflowOutcome::Completed,
            None => WorkflowOutcome::CompletedPartial,
        };

        Self {
            run_id: run_id.to_string(),
            outcome,
            waves_completed,
            phases_succeeded,
            phases_failed,
            phases_skipped,
            total_duration,
            manifest_path,
            phases,
            quality_warnings,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

mod duration_secs_f64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs_f64().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs_f64(f64::deserialize(d)?.max(0.0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::PhaseRun;
    use crate::manifest::{ManifestEntry, QualityRecord};
    use crate::phase::{Phase, PhaseCommand};

    fn registry(ids: &[&str]) -> PhaseRegistry {
        PhaseRegistry::new(
            ids.iter()
                .map(|id| Phase::new(id, PhaseCommand::shell("true")))
                .collect(),
        )
        .unwrap()
    }

    fn succeeded(id: &str) -> ManifestEntry {
        let mut run = PhaseRun::pending(id, 1);
        run.succeed(Duration::from_millis(500));
        ManifestEntry::from_run(&run, 0)
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut state = WorkflowState::Idle;
        state.transition(WorkflowState::WaveRunning(0)).unwrap();
        state.transition(WorkflowState::WaveEvaluated(0)).unwrap();
        state.transition(WorkflowState::WaveRunning(0)).unwrap();
        state.transition(WorkflowState::WaveEvaluated(0)).unwrap();
        state.transition(WorkflowState::WaveRunning(1)).unwrap();
        assert!(state.transition(WorkflowState::WaveRunning(2)).is_err());
        state.transition(WorkflowState::WaveEvaluated(1)).unwrap();
        state.transition(WorkflowState::Completed).unwrap();
        assert!(state.is_terminal());
        assert!(state.transition(WorkflowState::Aborted).is_err());
    }

    #[test]
    fn test_idle_cannot_skip_to_later_wave() {
        assert!(!WorkflowState::Idle.can_transition_to(WorkflowState::WaveRunning(1)));
        assert!(WorkflowState::Idle.can_transition_to(WorkflowState::Aborted));
        assert!(!WorkflowState::WaveRunning(0).can_transition_to(WorkflowState::Completed));
    }

    #[test]
    fn test_clean_completion() {
        let replay = ManifestReplay::from_entries([
            ManifestEntry::started("a", 1, 0),
            succeeded("a"),
            ManifestEntry::started("b", 1, 0),
            succeeded("b"),
        ]);
        let result = WorkflowResult::from_replay(
            "r1",
            &registry(&["a", "b"]),
            &replay,
            None,
            1,
            Duration::from_secs(1),
            PathBuf::from("m.jsonl"),
        );
        assert_eq!(result.outcome, WorkflowOutcome::Completed);
        assert_eq!(result.exit_code(), 0);
        assert_eq!(result.phases_succeeded, 2);
        assert_eq!(result.phases[0].attempts, 1);
        assert_eq!(result.phases[0].exit_code, Some(0));
        assert_eq!(result.phases[0].duration_seconds, Some(0.5));
    }

    #[test]
    fn test_skipped_phase_makes_run_partial() {
        let replay = ManifestReplay::from_entries([
            succeeded("a"),
            ManifestEntry::skipped("b", 0, "application failure after 3 attempt(s)"),
        ]);
        let result = WorkflowResult::from_replay(
            "r1",
            &registry(&["a", "b"]),
            &replay,
            None,
            1,
            Duration::ZERO,
            PathBuf::from("m.jsonl"),
        );
        assert_eq!(result.outcome, WorkflowOutcome::CompletedPartial);
        assert_eq!(result.outcome.label(), "Completed (partial)");
        assert_eq!(result.exit_code(), 2);
        assert_eq!(result.phases_skipped, 1);
        assert!(result.phases[1].reason.as_ref().unwrap().contains("3 attempt"));
    }

    #[test]
    fn test_abort_is_distinct_from_partial() {
        let replay = ManifestReplay::from_entries([succeeded("a")]);
        let result = WorkflowResult::from_replay(
            "r1",
            &registry(&["a"]),
            &replay,
            Some("quality gate rejected a".into()),
            0,
            Duration::ZERO,
            PathBuf::from("m.jsonl"),
        );
        assert!(matches!(result.outcome, WorkflowOutcome::Aborted { .. }));
        assert_eq!(result.exit_code(), 1);
    }

    #[test]
    fn test_quality_warning_is_reported() {
        let record = QualityRecord {
            score: 6,
            threshold: 8,
            attempt: 3,
            max_attempts: 3,
            decision: GateDecision::AcceptWithWarning,
        };
        let replay = ManifestReplay::from_entries([
            succeeded("docs"),
            ManifestEntry::quality("docs", 0, record, "accepted"),
        ]);
        let result = WorkflowResult::from_replay(
            "r1",
            &registry(&["docs"]),
            &replay,
            None,
            1,
            Duration::ZERO,
            PathBuf::from("m.jsonl"),
        );
        assert_eq!(result.outcome, WorkflowOutcome::Completed);
        assert_eq!(result.quality_warnings.len(), 1);
        assert!(result.quality_warnings[0].contains("6/10"));
        assert_eq!(result.phases[0].exit_code, Some(0));
    }

    #[test]
    fn test_timeout_counts_as_failed_with_class() {
        let mut run = PhaseRun::pending("slow", 1);
        run.fail(FailureClass::Timeout, Some(124), "timeout".into(), Duration::from_secs(5));
        let replay = ManifestReplay::from_entries([ManifestEntry::from_run(&run, 0)]);
        let result = WorkflowResult::from_replay(
            "r1",
            &registry(&["slow"]),
            &replay,
            Some("fail-fast".into()),
            0,
            Duration::ZERO,
            PathBuf::from("m.jsonl"),
        );
        assert_eq!(result.phases_failed, 1);
        assert_eq!(result.phases[0].failure, Some(FailureClass::Timeout));
        assert_eq!(result.phases[0].status, Some(ManifestStatus::Timeout));
    }
}
