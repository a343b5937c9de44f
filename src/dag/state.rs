//! Per-invocation run records produced by the executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::manifest::ManifestStatus;

/// Exit code conventionally returned by timeout wrappers (`timeout(1)`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Lifecycle of one phase invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Skipped
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }

    /// Manifest projection of this status.
    pub fn manifest_status(&self) -> ManifestStatus {
        match self {
            Self::Pending | Self::Running => ManifestStatus::Started,
            Self::Succeeded => ManifestStatus::Success,
            Self::Failed => ManifestStatus::Failed,
            Self::TimedOut => ManifestStatus::Timeout,
            Self::Skipped => ManifestStatus::Skipped,
        }
    }
}

/// Why a run failed. Timeouts and application exits have different remediation
/// (resource tuning vs. a logic bug) and are never merged in reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Killed by the orchestrator's timer, or exited with the timeout-wrapper code
    Timeout,
    /// Non-zero exit (or signal) from the command itself
    Application,
    /// The process could not be started
    Launch,
    /// Killed because the workflow was cancelled
    Cancelled,
}

impl FailureClass {
    /// Classify a process exit code. 124 is the timeout-wrapper convention.
    pub fn from_exit_code(code: i32) -> Option<Self> {
        match code {
            0 => None,
            TIMEOUT_EXIT_CODE => Some(Self::Timeout),
            _ => Some(Self::Application),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Application => "application",
            Self::Launch => "launch",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase-specific output sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRef {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// One invocation of a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRun {
    pub phase_id: String,
    pub attempt: u32,
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputRef>,
}

impl PhaseRun {
    pub fn pending(phase_id: &str, attempt: u32) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            attempt,
            status: PhaseStatus::Pending,
            exit_code: None,
            failure: None,
            error: None,
            start_time: None,
            end_time: None,
            duration: Duration::ZERO,
            output: None,
        }
    }

    pub fn start(&mut self) {
        self.status = PhaseStatus::Running;
        self.start_time = Some(Utc::now());
    }

    pub fn succeed(&mut self, duration: Duration) {
        self.finish(PhaseStatus::Succeeded, Some(0), None, None, duration);
    }

    pub fn fail(
        &mut self,
        class: FailureClass,
        exit_code: Option<i32>,
        error: String,
        duration: Duration,
    ) {
        let status = match class {
            FailureClass::Timeout => PhaseStatus::TimedOut,
            _ => PhaseStatus::Failed,
        };
        self.finish(status, exit_code, Some(class), Some(error), duration);
    }

    pub fn skip(&mut self, reason: &str) {
        self.finish(
            PhaseStatus::Skipped,
            None,
            None,
            Some(reason.to_string()),
            Duration::ZERO,
        );
    }

    fn finish(
        &mut self,
        status: PhaseStatus,
        exit_code: Option<i32>,
        failure: Option<FailureClass>,
        error: Option<String>,
        duration: Duration,
    ) {
        self.status = status;
        self.exit_code = exit_code;
        self.failure = failure;
        self.error = error;
        self.end_time = Some(Utc::now());
        self.duration = duration;
    }

    pub fn is_cancelled(&self) -> bool {
        self.failure == Some(FailureClass::Cancelled)
    }
}

/// Results of executing one batch of phases, keyed by phase id.
#[derive(Debug, Clone, Default)]
pub struct WaveReport {
    pub wave: usize,
    pub runs: BTreeMap<String, PhaseRun>,
    pub duration: Duration,
}

impl WaveReport {
    pub fn new(wave: usize) -> Self {
        Self {
            wave,
            ..Default::default()
        }
    }

    pub fn record(&mut self, run: PhaseRun) {
        self.runs.insert(run.phase_id.clone(), run);
    }

    pub fn get(&self, id: &str) -> Option<&PhaseRun> {
        self.runs.get(id)
    }

    pub fn succeeded(&self) -> usize {
        self.runs.values().filter(|r| r.status.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.runs.values().filter(|r| r.status.is_failure()).count()
    }

    pub fn all_success(&self) -> bool {
        self.runs.values().all(|r| r.status.is_success())
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serde helpers for Duration serialization.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_status_terminal() {
        assert!(!PhaseStatus::Pending.is_terminal());
        assert!(!PhaseStatus::Running.is_terminal());
        assert!(PhaseStatus::Succeeded.is_terminal());
        assert!(PhaseStatus::Failed.is_terminal());
        assert!(PhaseStatus::TimedOut.is_terminal());
        assert!(PhaseStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_exit_code_classification() {
        assert_eq!(FailureClass::from_exit_code(0), None);
        assert_eq!(FailureClass::from_exit_code(1), Some(FailureClass::Application));
        assert_eq!(FailureClass::from_exit_code(124), Some(FailureClass::Timeout));
        assert_eq!(FailureClass::from_exit_code(137), Some(FailureClass::Application));
    }

    #[test]
    fn test_timeout_failure_maps_to_timed_out_status() {
        let mut run = PhaseRun::pending("slow", 1);
        run.start();
        run.fail(
            FailureClass::Timeout,
            Some(TIMEOUT_EXIT_CODE),
            "timed out".into(),
            Duration::from_secs(5),
        );
        assert_eq!(run.status, PhaseStatus::TimedOut);
        assert_eq!(run.status.manifest_status(), ManifestStatus::Timeout);

        let mut run = PhaseRun::pending("bad", 1);
        run.fail(FailureClass::Application, Some(1), "exit 1".into(), Duration::ZERO);
        assert_eq!(run.status, PhaseStatus::Failed);
        assert_eq!(run.status.manifest_status(), ManifestStatus::Failed);
    }

    #[test]
    fn test_run_serialization_omits_empty_fields() {
        let mut run = PhaseRun::pending("a", 1);
        run.succeed(Duration::from_millis(1500));
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"], "succeeded");
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["duration"], 1500);
        assert!(json.get("failure").is_none());
    }

    #[test]
    fn test_wave_report_counts() {
        let mut report = WaveReport::new(0);
        let mut ok = PhaseRun::pending("a", 1);
        ok.succeed(Duration::ZERO);
        let mut ok2 = PhaseRun::pending("b", 1);
        ok2.succeed(Duration::ZERO);
        let mut bad = PhaseRun::pending("c", 1);
        bad.fail(FailureClass::Application, Some(2), "boom".into(), Duration::ZERO);
        report.record(ok);
        report.record(ok2);
        report.record(bad);

        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 1);
        assert!(!report.all_success());
        assert_eq!(report.get("c").unwrap().exit_code, Some(2));
    }
}
