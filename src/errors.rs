//! Typed error hierarchy for the phase orchestrator.
//!
//! Two top-level enums cover the two failure scopes:
//! - `PhaseError`: phase-local failures, captured into a `PhaseRun` by the executor
//!   and never propagated past it
//! - `WorkflowError`: terminal failures that stop a workflow (or prevent it from starting)

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::dag::{FailureClass, TIMEOUT_EXIT_CODE};

/// An unsatisfiable dependency graph. `cycle` lists the phases along one cycle, in
/// dependency order, with the first phase repeated at the end.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cycle detected in phase dependencies: {}", .cycle.join(" -> "))]
pub struct CycleError {
    pub cycle: Vec<String>,
}

impl CycleError {
    pub fn new(cycle: Vec<String>) -> Self {
        Self { cycle }
    }

    /// Check whether a phase lies on the reported cycle.
    pub fn involves(&self, phase: &str) -> bool {
        self.cycle.iter().any(|p| p == phase)
    }
}

/// Errors from a single phase invocation.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Phase {phase} timed out after {}s", .timeout.as_secs_f64())]
    Timeout { phase: String, timeout: Duration },

    #[error("Phase {phase} exited with timeout-wrapper code {exit_code}")]
    TimeoutExit { phase: String, exit_code: i32 },

    #[error("Phase {phase} exited with non-zero code {exit_code}")]
    Application { phase: String, exit_code: i32 },

    #[error("Phase {phase} was terminated by a signal")]
    Signaled { phase: String },

    #[error("Failed to spawn phase {phase}: {source}")]
    SpawnFailed {
        phase: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open output sink {path} for phase {phase}: {source}")]
    OutputCapture {
        phase: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Phase {phase} was cancelled")]
    Cancelled { phase: String },
}

impl PhaseError {
    /// The failure class recorded for this error in runs and reports.
    pub fn class(&self) -> FailureClass {
        match self {
            PhaseError::Timeout { .. } | PhaseError::TimeoutExit { .. } => FailureClass::Timeout,
            PhaseError::Application { .. } | PhaseError::Signaled { .. } => {
                FailureClass::Application
            }
            PhaseError::SpawnFailed { .. } | PhaseError::OutputCapture { .. } => {
                FailureClass::Launch
            }
            PhaseError::Cancelled { .. } => FailureClass::Cancelled,
        }
    }

    /// Exit code recorded for the failed run. A timeout enforced by the orchestrator
    /// reports the timeout-wrapper code, like `timeout(1)` would.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PhaseError::Timeout { .. } => Some(TIMEOUT_EXIT_CODE),
            PhaseError::TimeoutExit { exit_code, .. } | PhaseError::Application { exit_code, .. } => {
                Some(*exit_code)
            }
            _ => None,
        }
    }
}

/// Errors that end (or prevent) a workflow run.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("Phase {phase} depends on unknown phase {dependency}")]
    UnknownDependency { phase: String, dependency: String },

    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),

    #[error("Phase id must not be empty")]
    EmptyPhaseId,

    #[error(
        "Quality gate rejected phase {phase}: score {score}/10 below threshold {threshold} after {attempts} attempt(s)"
    )]
    QualityThreshold {
        phase: String,
        score: u8,
        threshold: u8,
        attempts: u32,
    },

    #[error("Failed to write manifest at {path}: {source}")]
    ManifestWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Workflow aborted at phase {phase}: {reason}")]
    Aborted { phase: String, reason: String },

    #[error("Workflow cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Errors that end a run without going through the failure handler.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkflowError::Cycle(_)
                | WorkflowError::UnknownDependency { .. }
                | WorkflowError::DuplicatePhase(_)
                | WorkflowError::EmptyPhaseId
                | WorkflowError::ManifestWrite { .. }
                | WorkflowError::Other(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_names_every_phase_on_the_cycle() {
        let err = CycleError::new(vec!["a".into(), "b".into(), "a".into()]);
        assert!(err.involves("a"));
        assert!(err.involves("b"));
        assert!(!err.involves("c"));
        assert_eq!(
            err.to_string(),
            "Cycle detected in phase dependencies: a -> b -> a"
        );
    }

    #[test]
    fn phase_error_classes_keep_timeout_and_exit_code_apart() {
        let timeout = PhaseError::Timeout {
            phase: "build".into(),
            timeout: Duration::from_secs(5),
        };
        let app = PhaseError::Application {
            phase: "build".into(),
            exit_code: 1,
        };
        assert_eq!(timeout.class(), FailureClass::Timeout);
        assert_eq!(app.class(), FailureClass::Application);
        assert_ne!(timeout.class(), app.class());
        assert!(app.to_string().contains("code 1"));
        assert_eq!(timeout.exit_code(), Some(124));
        assert_eq!(app.exit_code(), Some(1));
    }

    #[test]
    fn wrapper_exit_124_is_a_timeout() {
        let err = PhaseError::TimeoutExit {
            phase: "x".into(),
            exit_code: 124,
        };
        assert_eq!(err.class(), FailureClass::Timeout);
        assert_eq!(err.exit_code(), Some(124));
    }

    #[test]
    fn spawn_failure_is_a_launch_error() {
        let err = PhaseError::SpawnFailed {
            phase: "x".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such binary"),
        };
        assert_eq!(err.class(), FailureClass::Launch);
    }

    #[test]
    fn workflow_error_converts_from_cycle_error() {
        let err: WorkflowError = CycleError::new(vec!["x".into(), "x".into()]).into();
        assert!(matches!(err, WorkflowError::Cycle(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn quality_threshold_is_not_fatal() {
        let err = WorkflowError::QualityThreshold {
            phase: "docs".into(),
            score: 7,
            threshold: 8,
            attempts: 3,
        };
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("7/10"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&CycleError::new(vec![]));
        assert_std_error(&PhaseError::Cancelled { phase: "x".into() });
        assert_std_error(&WorkflowError::Cancelled);
    }
}
