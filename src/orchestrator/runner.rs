//! Workflow driver: runs the resolved waves in order.
//!
//! For each wave the driver launches every runnable phase through the executor,
//! consults the failure handler on each failed run, gates quality-gated phases, and
//! only then moves on. A phase in wave k+1 is never launched before every phase of
//! wave k has reached a terminal state.

use async_trait::async_trait;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::failure::{FailureAction, FailureHandler, RetryPolicy};
use super::state::{WorkflowResult, WorkflowState};
use crate::dag::{
    ExecutionPlan, ExecutionTimer, Invocation, PhaseExecutor, PhaseGraph, PhaseRun, PhaseStatus,
    Wave, resolve,
};
use crate::errors::WorkflowError;
use crate::gates::{
    ConfiguredPolicy, GateDecision, GateOutcome, QualityDisposition, QualityGate, QualityPolicy,
    Regenerate, load_artifact,
};
use crate::manifest::{self, ManifestEntry};
use crate::phase::{Phase, PhaseRegistry};

const CANCELLED: &str = "workflow cancelled";

/// Settings for one workflow run.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub run_id: String,
    pub retry: RetryPolicy,
    pub gate: QualityGate,
    /// Skip phases whose latest manifest status is already `success`
    pub resume: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            run_id: String::new(),
            retry: RetryPolicy::default(),
            gate: QualityGate::default(),
            resume: false,
        }
    }
}

/// Phases handed to the executor in one round, after retries.
#[derive(Debug, Default)]
struct RoundOutcome {
    succeeded: BTreeMap<String, PhaseRun>,
    skipped: Vec<String>,
    abort: Option<String>,
}

/// Top-level loop over the wave sequence.
pub struct WorkflowDriver {
    registry: PhaseRegistry,
    executor: PhaseExecutor,
    failure: FailureHandler,
    gate: QualityGate,
    policy: Box<dyn QualityPolicy>,
    run_id: String,
    resume: bool,
    state: WorkflowState,
    regenerations: AtomicU32,
    /// Last attempt number used per phase, across retries and regenerations
    attempts: HashMap<String, u32>,
    /// Phases with a terminal manifest entry for this run (or a prior success)
    settled: HashSet<String>,
    /// Phases that must not run, with the reason they are skipped
    blocked: HashMap<String, String>,
}

impl WorkflowDriver {
    pub fn new(registry: PhaseRegistry, executor: PhaseExecutor, settings: DriverSettings) -> Self {
        Self {
            registry,
            executor,
            failure: FailureHandler::new(settings.retry),
            gate: settings.gate,
            policy: Box::new(ConfiguredPolicy {
                disposition: QualityDisposition::Abort,
                max_regenerations: 0,
            }),
            run_id: settings.run_id,
            resume: settings.resume,
            state: WorkflowState::Idle,
            regenerations: AtomicU32::new(0),
            attempts: HashMap::new(),
            settled: HashSet::new(),
            blocked: HashMap::new(),
        }
    }

    /// Set the disposition policy for exhausted quality gates.
    pub fn with_policy(mut self, policy: impl QualityPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn registry(&self) -> &PhaseRegistry {
        &self.registry
    }

    /// Execute the workflow and build its result from the manifest.
    ///
    /// Returns `Err` only for conditions that bypass the failure handler: a cyclic
    /// graph or a manifest write failure. Every other failure ends in a result.
    #[tracing::instrument(name = "workflow", skip_all, fields(run_id = %self.run_id))]
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<WorkflowResult, WorkflowError> {
        let timer = ExecutionTimer::start();
        let plan = resolve(&self.registry)?;
        let graph = PhaseGraph::from_registry(&self.registry);
        let manifest_path = self.executor.manifest().path().to_path_buf();

        let done = if self.resume {
            self.load_resume_state(&manifest_path)?
        } else {
            HashSet::new()
        };
        self.settled.extend(done.iter().cloned());

        tracing::info!(
            phases = self.registry.len(),
            waves = plan.len(),
            resumed = done.len(),
            "Starting workflow"
        );

        if plan.is_empty() {
            self.state.transition(WorkflowState::Completed)?;
        }

        let mut abort_reason: Option<String> = None;
        let mut waves_completed = 0;
        for wave in &plan.waves {
            if cancel.is_cancelled() {
                abort_reason = Some(CANCELLED.to_string());
                break;
            }
            self.state.transition(WorkflowState::WaveRunning(wave.index))?;
            tracing::info!(wave = wave.index, phases = ?wave.phases, "Wave started");

            match self.run_wave(wave, &graph, &done, cancel).await {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    abort_reason = Some(reason);
                    break;
                }
                Err(WorkflowError::Cancelled) => {
                    abort_reason = Some(CANCELLED.to_string());
                    break;
                }
                Err(e) => return Err(e),
            }

            self.state.transition(WorkflowState::WaveEvaluated(wave.index))?;
            waves_completed += 1;
        }

        match &abort_reason {
            Some(reason) => {
                tracing::error!(%reason, "Workflow aborted");
                self.state.transition(WorkflowState::Aborted)?;
                self.record_unreached(&plan, reason).await?;
            }
            None if !self.state.is_terminal() => {
                self.state.transition(WorkflowState::Completed)?;
            }
            None => {}
        }

        let replay = manifest::replay(&manifest_path)?;
        let result = WorkflowResult::from_replay(
            &self.run_id,
            &self.registry,
            &replay,
            abort_reason,
            waves_completed,
            timer.elapsed(),
            manifest_path,
        );
        tracing::info!(
            outcome = result.outcome.label(),
            succeeded = result.phases_succeeded,
            failed = result.phases_failed,
            skipped = result.phases_skipped,
            "Workflow finished"
        );
        Ok(result)
    }

    /// Run one wave to evaluation. Returns the abort reason if the workflow must stop.
    async fn run_wave(
        &mut self,
        wave: &Wave,
        graph: &PhaseGraph,
        done: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, WorkflowError> {
        let mut runnable = Vec::new();
        for id in &wave.phases {
            if done.contains(id) {
                tracing::info!(phase = %id, "Already succeeded in an earlier run; not re-running");
                continue;
            }
            if let Some(reason) = self.blocked.get(id).cloned() {
                tracing::warn!(phase = %id, %reason, "Skipping phase");
                self.executor
                    .manifest()
                    .append(ManifestEntry::skipped(id, wave.index, &reason))
                    .await?;
                self.settled.insert(id.clone());
                continue;
            }
            if let Some(phase) = self.registry.get(id) {
                runnable.push(phase.clone());
            }
        }

        let round = self.execute_round(wave.index, runnable, cancel).await?;
        self.block_dependents(&round.skipped, graph);
        if let Some(reason) = round.abort {
            return Ok(Some(reason));
        }
        let mut succeeded = round.succeeded;
        let mut to_gate = self.gated(succeeded.keys());

        while !to_gate.is_empty() {
            let results = {
                let gates = to_gate.iter().filter_map(|id| {
                    let phase = self.registry.get(id)?;
                    let run = succeeded.get(id)?;
                    Some(self.gate_phase(phase, wave.index, run, cancel))
                });
                join_all(gates).await
            };

            let mut partial = Vec::new();
            let mut segment = false;
            let mut abort = None;
            for result in results {
                let (outcome, last_attempt) = result?;
                self.bump_attempt(outcome.phase_id(), last_attempt);
                match outcome.decision {
                    GateDecision::Passed | GateDecision::AcceptWithWarning => {}
                    GateDecision::RegeneratePartial => partial.push(outcome.phase_id().to_string()),
                    GateDecision::RegenerateSegment => segment = true,
                    GateDecision::Abort => {
                        abort = abort.or_else(|| outcome.threshold_error().map(|e| e.to_string()));
                    }
                }
            }
            if abort.is_some() {
                return Ok(abort);
            }

            let rerun: Vec<Phase> = if segment {
                self.state.transition(WorkflowState::WaveEvaluated(wave.index))?;
                self.state.transition(WorkflowState::WaveRunning(wave.index))?;
                tracing::info!(wave = wave.index, "Regenerating wave segment");
                succeeded.keys().filter_map(|id| self.registry.get(id)).cloned().collect()
            } else {
                tracing::info!(phases = ?partial, "Regenerating phases");
                partial.iter().filter_map(|id| self.registry.get(id)).cloned().collect()
            };
            if rerun.is_empty() {
                break;
            }

            let round = self.execute_round(wave.index, rerun, cancel).await?;
            for id in &round.skipped {
                succeeded.remove(id);
            }
            self.block_dependents(&round.skipped, graph);
            if let Some(reason) = round.abort {
                return Ok(Some(reason));
            }
            to_gate = self.gated(round.succeeded.keys());
            succeeded.extend(round.succeeded);
        }

        Ok(None)
    }

    /// Launch phases and apply the failure handler until each one succeeds, is
    /// skipped, or the round is aborted.
    async fn execute_round(
        &mut self,
        wave: usize,
        phases: Vec<Phase>,
        cancel: &CancellationToken,
    ) -> Result<RoundOutcome, WorkflowError> {
        let mut outcome = RoundOutcome::default();
        let mut made: HashMap<String, u32> = HashMap::new();
        let mut invocations: Vec<Invocation> =
            phases.iter().map(|p| self.next_invocation(p)).collect();

        while !invocations.is_empty() {
            let report = self.executor.run_wave(wave, invocations, cancel).await?;
            invocations = Vec::new();
            let mut delay = Duration::ZERO;

            for (id, run) in report.runs {
                self.bump_attempt(&id, run.attempt);
                self.settled.insert(id.clone());
                let attempts_made = {
                    let n = made.entry(id.clone()).or_insert(0);
                    *n += 1;
                    *n
                };

                if run.status.is_success() {
                    outcome.succeeded.insert(id, run);
                    continue;
                }
                if run.status == PhaseStatus::Skipped {
                    outcome.abort.get_or_insert_with(|| CANCELLED.to_string());
                    continue;
                }
                let Some(phase) = self.registry.get(&id).cloned() else {
                    continue;
                };

                match self.failure.decide(&phase, &run, attempts_made) {
                    FailureAction::Retry { delay: wait } => {
                        delay = delay.max(wait);
                        invocations.push(self.next_invocation(&phase));
                    }
                    FailureAction::Skip { reason } => {
                        tracing::warn!(phase = %id, %reason, "Skipping phase after failure");
                        self.executor
                            .manifest()
                            .append(ManifestEntry::skipped(&id, wave, &reason))
                            .await?;
                        outcome.skipped.push(id);
                    }
                    FailureAction::Abort { reason } => {
                        outcome
                            .abort
                            .get_or_insert_with(|| format!("phase {id}: {reason}"));
                    }
                }
            }

            if outcome.abort.is_some() {
                break;
            }
            if !invocations.is_empty() && !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        outcome.abort = Some(CANCELLED.to_string());
                        break;
                    }
                }
            }
        }

        Ok(outcome)
    }

    async fn gate_phase(
        &self,
        phase: &Phase,
        wave: usize,
        run: &PhaseRun,
        cancel: &CancellationToken,
    ) -> Result<(GateOutcome, u32), WorkflowError> {
        let artifact = load_artifact(phase, run, &self.executor.config().base_dir).await;
        let regenerator = ExecutorRegenerator {
            executor: &self.executor,
            wave,
            base_attempt: run.attempt,
            last_attempt: AtomicU32::new(run.attempt),
            cancel,
        };
        let outcome = self
            .gate
            .evaluate(
                phase,
                wave,
                artifact,
                &regenerator,
                self.policy.as_ref(),
                &self.regenerations,
                self.executor.manifest(),
            )
            .await?;
        Ok((outcome, regenerator.last_attempt.load(Ordering::SeqCst)))
    }

    fn gated<'a>(&self, ids: impl Iterator<Item = &'a String>) -> Vec<String> {
        ids.filter(|id| self.registry.get(id).is_some_and(|p| p.quality_gated))
            .cloned()
            .collect()
    }

    fn next_invocation(&self, phase: &Phase) -> Invocation {
        match self.attempts.get(&phase.id) {
            Some(&last) => Invocation::retry(phase, last + 1),
            None => Invocation::initial(phase),
        }
    }

    fn bump_attempt(&mut self, id: &str, attempt: u32) {
        let last = self.attempts.entry(id.to_string()).or_insert(0);
        *last = (*last).max(attempt);
    }

    fn block_dependents(&mut self, skipped: &[String], graph: &PhaseGraph) {
        for id in skipped {
            let Some(index) = graph.index_of(id) else {
                continue;
            };
            for dependent in graph.transitive_dependents(index) {
                self.blocked
                    .entry(graph.id(dependent).to_string())
                    .or_insert_with(|| format!("dependency {id} was skipped"));
            }
        }
    }

    /// Record every phase the aborted run never settled as skipped.
    async fn record_unreached(&mut self, plan: &ExecutionPlan, reason: &str) -> Result<(), WorkflowError> {
        let reason = format!("workflow aborted: {reason}");
        for wave in &plan.waves {
            for id in &wave.phases {
                if self.settled.insert(id.clone()) {
                    self.executor
                        .manifest()
                        .append(ManifestEntry::skipped(id, wave.index, &reason))
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Load prior attempts and the set of already-succeeded phases from the manifest.
    fn load_resume_state(&mut self, path: &Path) -> Result<HashSet<String>, WorkflowError> {
        let replay = manifest::replay(path)?;
        for entry in &replay.entries {
            if let Some(attempt) = entry.attempt {
                self.bump_attempt(&entry.phase, attempt);
            }
        }
        let done: HashSet<String> = replay
            .succeeded_phases()
            .into_iter()
            .filter(|id| match self.registry.get(id) {
                Some(phase) if phase.quality_gated => {
                    let accepted = replay.gate_accepted(id);
                    if !accepted {
                        tracing::warn!(phase = %id, "No accepting gate decision recorded; re-running");
                    }
                    accepted
                }
                Some(_) => true,
                None => false,
            })
            .collect();
        tracing::info!(succeeded = done.len(), entries = replay.entries.len(), "Resuming run");
        Ok(done)
    }
}

/// Re-runs a gated phase through the executor for the quality gate.
struct ExecutorRegenerator<'a> {
    executor: &'a PhaseExecutor,
    wave: usize,
    base_attempt: u32,
    last_attempt: AtomicU32,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl Regenerate for ExecutorRegenerator<'_> {
    async fn regenerate(&self, phase: &Phase, attempt: u32) -> Result<Option<String>, WorkflowError> {
        let run_attempt = self.base_attempt + attempt.saturating_sub(1);
        self.last_attempt.fetch_max(run_attempt, Ordering::SeqCst);

        let report = self
            .executor
            .run_wave(
                self.wave,
                vec![Invocation::regeneration(phase, run_attempt)],
                self.cancel,
            )
            .await?;

        match report.get(&phase.id) {
            Some(run) if run.status.is_success() => {
                Ok(load_artifact(phase, run, &self.executor.config().base_dir).await)
            }
            Some(run) if run.is_cancelled() || run.status == PhaseStatus::Skipped => {
                Err(WorkflowError::Cancelled)
            }
            Some(run) => {
                tracing::warn!(phase = %phase.id, status = ?run.status, "Regeneration run failed");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::ExecutorConfig;
    use crate::manifest::{ManifestLogger, ManifestOptions, ManifestStatus};
    use crate::orchestrator::failure::ExhaustedAction;
    use crate::orchestrator::state::WorkflowOutcome;
    use crate::phase::PhaseCommand;
    use tempfile::TempDir;

    fn sh(id: &str, script: &str) -> Phase {
        Phase::new(id, PhaseCommand::shell(script))
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            backoff: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    fn settings(retry: RetryPolicy) -> DriverSettings {
        DriverSettings {
            run_id: "test".into(),
            retry,
            gate: QualityGate::new(8, 1),
            resume: false,
        }
    }

    struct Run {
        result: Result<WorkflowResult, WorkflowError>,
        entries: Vec<ManifestEntry>,
    }

    impl Run {
        fn result(&self) -> &WorkflowResult {
            self.result.as_ref().unwrap()
        }

        fn started(&self, phase: &str) -> usize {
            self.entries
                .iter()
                .filter(|e| e.phase == phase && e.status == ManifestStatus::Started)
                .count()
        }

        fn latest(&self, phase: &str) -> ManifestStatus {
            self.entries
                .iter()
                .rev()
                .find(|e| e.phase == phase)
                .map(|e| e.status)
                .unwrap()
        }
    }

    async fn run_workflow(
        dir: &Path,
        phases: Vec<Phase>,
        settings: DriverSettings,
        policy: Option<ConfiguredPolicy>,
        cancel: CancellationToken,
    ) -> Run {
        let path = dir.join("manifest.jsonl");
        let logger = ManifestLogger::open(&path, ManifestOptions::default()).unwrap();
        let executor = PhaseExecutor::new(ExecutorConfig::new(dir, dir.join("logs")), logger.handle());
        let registry = PhaseRegistry::new(phases).unwrap();
        let mut driver = WorkflowDriver::new(registry, executor, settings);
        if let Some(policy) = policy {
            driver = driver.with_policy(policy);
        }
        let result = driver.run(&cancel).await;
        drop(driver);
        logger.close().await;
        let entries = manifest::replay(&path).unwrap().entries;
        Run { result, entries }
    }

    #[tokio::test]
    async fn test_canonical_workflow_runs_waves_in_order() {
        let dir = TempDir::new().unwrap();
        let phases = vec![
            sh("A", "sleep 0.1"),
            sh("B", "true"),
            sh("C", "true").with_dependencies(["A", "B"]),
            sh("D", "true").with_dependencies(["C"]),
            sh("E", "true").with_dependencies(["A"]),
        ];
        let run = run_workflow(dir.path(), phases, settings(fast_retry()), None, CancellationToken::new()).await;

        let result = run.result();
        assert_eq!(result.outcome, WorkflowOutcome::Completed);
        assert_eq!(result.waves_completed, 3);
        assert_eq!(result.phases_succeeded, 5);

        // Every terminal entry of wave k precedes every started entry of wave k+1.
        let position = |phase: &str, status: ManifestStatus| {
            run.entries
                .iter()
                .position(|e| e.phase == phase && e.status == status)
                .unwrap()
        };
        assert!(position("A", ManifestStatus::Success) < position("C", ManifestStatus::Started));
        assert!(position("B", ManifestStatus::Success) < position("C", ManifestStatus::Started));
        assert!(position("A", ManifestStatus::Success) < position("E", ManifestStatus::Started));
        assert!(position("C", ManifestStatus::Success) < position("D", ManifestStatus::Started));
        assert!(position("E", ManifestStatus::Success) < position("D", ManifestStatus::Started));
    }

    #[tokio::test]
    async fn test_failed_phase_is_skipped_with_its_dependents() {
        let dir = TempDir::new().unwrap();
        let phases = vec![
            sh("ok1", "true"),
            sh("bad", "exit 1").with_retryable(false),
            sh("ok2", "true"),
            sh("after-bad", "true").with_dependencies(["bad"]),
            sh("grandchild", "true").with_dependencies(["after-bad"]),
            sh("after-ok", "true").with_dependencies(["ok1"]),
        ];
        let run = run_workflow(dir.path(), phases, settings(fast_retry()), None, CancellationToken::new()).await;

        let result = run.result();
        assert_eq!(result.outcome, WorkflowOutcome::CompletedPartial);
        assert_eq!(result.exit_code(), 2);
        assert_eq!(run.latest("ok1"), ManifestStatus::Success);
        assert_eq!(run.latest("ok2"), ManifestStatus::Success);
        assert_eq!(run.latest("after-ok"), ManifestStatus::Success);
        assert_eq!(run.latest("bad"), ManifestStatus::Skipped);
        assert_eq!(run.latest("after-bad"), ManifestStatus::Skipped);
        assert_eq!(run.latest("grandchild"), ManifestStatus::Skipped);
        assert_eq!(run.started("bad"), 1);
        assert_eq!(run.started("after-bad"), 0);

        let bad = result.phases.iter().find(|p| p.phase == "bad").unwrap();
        assert_eq!(bad.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_retry_recovers_flaky_phase() {
        let dir = TempDir::new().unwrap();
        let phases = vec![sh(
            "flaky",
            "if [ -f flaky.marker ]; then exit 0; else touch flaky.marker; exit 1; fi",
        )];
        let run = run_workflow(dir.path(), phases, settings(fast_retry()), None, CancellationToken::new()).await;

        let result = run.result();
        assert_eq!(result.outcome, WorkflowOutcome::Completed);
        assert_eq!(run.started("flaky"), 2);
        assert_eq!(result.phases[0].attempts, 2);
        let attempts: Vec<Option<u32>> = run
            .entries
            .iter()
            .filter(|e| e.phase == "flaky" && e.status.is_terminal())
            .map(|e| e.attempt)
            .collect();
        assert_eq!(attempts, vec![Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn test_fail_fast_aborts_and_skips_remaining_waves() {
        let dir = TempDir::new().unwrap();
        let phases = vec![
            sh("first", "exit 2"),
            sh("second", "true").with_dependencies(["first"]),
        ];
        let retry = RetryPolicy {
            fail_fast: true,
            ..fast_retry()
        };
        let run = run_workflow(dir.path(), phases, settings(retry), None, CancellationToken::new()).await;

        let result = run.result();
        assert!(matches!(result.outcome, WorkflowOutcome::Aborted { .. }));
        assert_eq!(result.exit_code(), 1);
        assert_eq!(run.started("first"), 1);
        assert_eq!(run.latest("first"), ManifestStatus::Failed);
        assert_eq!(run.latest("second"), ManifestStatus::Skipped);
        assert_eq!(run.started("second"), 0);
    }

    #[tokio::test]
    async fn test_exhausted_abort_policy_stops_the_workflow() {
        let dir = TempDir::new().unwrap();
        let phases = vec![sh("a", "exit 1"), sh("b", "true").with_dependencies(["a"])];
        let retry = RetryPolicy {
            max_attempts: 2,
            on_exhausted: ExhaustedAction::Abort,
            ..fast_retry()
        };
        let run = run_workflow(dir.path(), phases, settings(retry), None, CancellationToken::new()).await;

        assert!(matches!(run.result().outcome, WorkflowOutcome::Aborted { .. }));
        assert_eq!(run.started("a"), 2);
        assert_eq!(run.started("b"), 0);
    }

    #[tokio::test]
    async fn test_quality_gate_pass() {
        let dir = TempDir::new().unwrap();
        let phases = vec![sh("review", "echo 'Score: 9/10'").with_quality_gate(true)];
        let run = run_workflow(dir.path(), phases, settings(fast_retry()), None, CancellationToken::new()).await;

        assert_eq!(run.result().outcome, WorkflowOutcome::Completed);
        let gate = run.entries.iter().find(|e| e.quality.is_some()).unwrap();
        assert_eq!(gate.quality.as_ref().unwrap().decision, GateDecision::Passed);
    }

    #[tokio::test]
    async fn test_quality_gate_abort_records_decision_and_stops() {
        let dir = TempDir::new().unwrap();
        let phases = vec![
            sh("review", "echo 'Score: 5/10'").with_quality_gate(true),
            sh("publish", "true").with_dependencies(["review"]),
        ];
        let run = run_workflow(dir.path(), phases, settings(fast_retry()), None, CancellationToken::new()).await;

        let result = run.result();
        match &result.outcome {
            WorkflowOutcome::Aborted { reason } => assert!(reason.contains("5/10")),
            other => panic!("expected abort, got {other:?}"),
        }
        let gate = run.entries.iter().find(|e| e.quality.is_some()).unwrap();
        assert_eq!(gate.status, ManifestStatus::Failed);
        assert_eq!(gate.quality.as_ref().unwrap().decision, GateDecision::Abort);
        assert_eq!(run.latest("publish"), ManifestStatus::Skipped);
    }

    #[tokio::test]
    async fn test_quality_gate_regenerates_before_policy() {
        let dir = TempDir::new().unwrap();
        let phases = vec![
            sh("review", "echo 'Score: 4/10'")
                .with_quality_gate(true)
                .with_regenerate(PhaseCommand::shell("echo 'Score: 8/10'")),
        ];
        let mut s = settings(fast_retry());
        s.gate = QualityGate::new(8, 3);
        let run = run_workflow(dir.path(), phases, s, None, CancellationToken::new()).await;

        assert_eq!(run.result().outcome, WorkflowOutcome::Completed);
        assert_eq!(run.started("review"), 2);
        let gate = run.entries.iter().find(|e| e.quality.is_some()).unwrap();
        assert_eq!(gate.quality.as_ref().unwrap().attempt, 2);
    }

    #[tokio::test]
    async fn test_accept_with_warning_completes_with_warning() {
        let dir = TempDir::new().unwrap();
        let phases = vec![sh("review", "echo 'Score: 6/10'").with_quality_gate(true)];
        let policy = ConfiguredPolicy {
            disposition: QualityDisposition::AcceptWithWarning,
            max_regenerations: 0,
        };
        let run = run_workflow(dir.path(), phases, settings(fast_retry()), Some(policy), CancellationToken::new()).await;

        let result = run.result();
        assert_eq!(result.outcome, WorkflowOutcome::Completed);
        assert_eq!(result.quality_warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_regeneration_reruns_phase() {
        let dir = TempDir::new().unwrap();
        let phases = vec![
            sh(
                "review",
                "if [ -f regen.marker ]; then echo 'Score: 9/10'; else touch regen.marker; echo 'Score: 5/10'; fi",
            )
            .with_quality_gate(true),
            sh("sibling", "true"),
        ];
        let policy = ConfiguredPolicy {
            disposition: QualityDisposition::RegeneratePartial,
            max_regenerations: 1,
        };
        let run = run_workflow(dir.path(), phases, settings(fast_retry()), Some(policy), CancellationToken::new()).await;

        assert_eq!(run.result().outcome, WorkflowOutcome::Completed);
        assert_eq!(run.started("review"), 2);
        assert_eq!(run.started("sibling"), 1);
        let decisions: Vec<GateDecision> = run
            .entries
            .iter()
            .filter_map(|e| e.quality.as_ref().map(|q| q.decision))
            .collect();
        assert_eq!(decisions, vec![GateDecision::RegeneratePartial, GateDecision::Passed]);
    }

    #[tokio::test]
    async fn test_segment_regeneration_reruns_wave_once() {
        let dir = TempDir::new().unwrap();
        let phases = vec![
            sh("review", "echo 'Score: 5/10'").with_quality_gate(true),
            sh("sibling", "true"),
        ];
        let policy = ConfiguredPolicy {
            disposition: QualityDisposition::RegenerateSegment,
            max_regenerations: 1,
        };
        let run = run_workflow(dir.path(), phases, settings(fast_retry()), Some(policy), CancellationToken::new()).await;

        assert!(matches!(run.result().outcome, WorkflowOutcome::Aborted { .. }));
        assert_eq!(run.started("review"), 2);
        assert_eq!(run.started("sibling"), 2);
    }

    #[tokio::test]
    async fn test_resume_skips_succeeded_phases() {
        let dir = TempDir::new().unwrap();
        let phases = || {
            vec![
                sh("a", "echo a >> a.count"),
                sh("b", "test -f ready").with_retryable(false).with_dependencies(["a"]),
            ]
        };
        let first = run_workflow(dir.path(), phases(), settings(fast_retry()), None, CancellationToken::new()).await;
        assert_eq!(first.result().outcome, WorkflowOutcome::CompletedPartial);

        std::fs::write(dir.path().join("ready"), "").unwrap();
        let mut s = settings(fast_retry());
        s.resume = true;
        let second = run_workflow(dir.path(), phases(), s, None, CancellationToken::new()).await;

        assert_eq!(second.result().outcome, WorkflowOutcome::Completed);
        assert_eq!(second.started("a"), 1);
        assert_eq!(second.started("b"), 2);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.count")).unwrap(), "a\n");
        let b_attempts: Vec<Option<u32>> = second
            .entries
            .iter()
            .filter(|e| e.phase == "b" && e.status == ManifestStatus::Started)
            .map(|e| e.attempt)
            .collect();
        assert_eq!(b_attempts, vec![Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn test_resume_regates_phase_without_gate_decision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.jsonl");
        {
            let logger = ManifestLogger::open(&path, ManifestOptions::default()).unwrap();
            let handle = logger.handle();
            handle.append(ManifestEntry::started("review", 1, 0)).await.unwrap();
            let mut success = ManifestEntry::started("review", 1, 0);
            success.status = ManifestStatus::Success;
            success.exit_code = Some(0);
            handle.append(success).await.unwrap();
            logger.close().await;
        }

        let mut s = settings(fast_retry());
        s.resume = true;
        let phases = vec![sh("review", "echo 'Score: 2/10'").with_quality_gate(true)];
        let run = run_workflow(dir.path(), phases, s, None, CancellationToken::new()).await;

        assert!(matches!(run.result().outcome, WorkflowOutcome::Aborted { .. }));
        assert_eq!(run.started("review"), 2);
        let gate = run
            .entries
            .iter()
            .filter_map(|e| e.quality.as_ref())
            .collect::<Vec<_>>();
        assert_eq!(gate.len(), 1);
        assert_eq!(gate[0].decision, GateDecision::Abort);
    }

    #[tokio::test]
    async fn test_resume_keeps_gate_accepted_phase() {
        let dir = TempDir::new().unwrap();
        let phases = || vec![sh("review", "echo 'Score: 9/10'; echo x >> runs.count").with_quality_gate(true)];
        let first = run_workflow(dir.path(), phases(), settings(fast_retry()), None, CancellationToken::new()).await;
        assert_eq!(first.result().outcome, WorkflowOutcome::Completed);

        let mut s = settings(fast_retry());
        s.resume = true;
        let second = run_workflow(dir.path(), phases(), s, None, CancellationToken::new()).await;

        assert_eq!(second.result().outcome, WorkflowOutcome::Completed);
        assert_eq!(second.started("review"), 1);
        assert_eq!(std::fs::read_to_string(dir.path().join("runs.count")).unwrap(), "x\n");
    }

    #[tokio::test]
    async fn test_timed_out_phase_leaves_no_background_work() {
        let dir = TempDir::new().unwrap();
        let phases = vec![
            sh("spawner", "(sleep 1; touch late.marker) & wait")
                .with_timeout(Duration::from_millis(200))
                .with_max_attempts(1),
        ];
        let run = run_workflow(dir.path(), phases, settings(fast_retry()), None, CancellationToken::new()).await;

        assert_eq!(run.result().outcome, WorkflowOutcome::CompletedPartial);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late.marker").exists());
    }

    #[tokio::test]
    async fn test_cycle_is_fatal() {
        let dir = TempDir::new().unwrap();
        let phases = vec![
            sh("x", "true").with_dependencies(["y"]),
            sh("y", "true").with_dependencies(["x"]),
        ];
        let run = run_workflow(dir.path(), phases, settings(fast_retry()), None, CancellationToken::new()).await;

        assert!(matches!(run.result, Err(WorkflowError::Cycle(_))));
        assert!(run.entries.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_kills_wave_and_aborts() {
        let dir = TempDir::new().unwrap();
        let phases = vec![sh("long", "sleep 30"), sh("next", "true").with_dependencies(["long"])];
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let run = run_workflow(dir.path(), phases, settings(fast_retry()), None, cancel).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        match &run.result().outcome {
            WorkflowOutcome::Aborted { reason } => assert!(reason.contains("cancelled")),
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(run.latest("next"), ManifestStatus::Skipped);
    }

    #[tokio::test]
    async fn test_empty_registry_completes() {
        let dir = TempDir::new().unwrap();
        let run = run_workflow(dir.path(), vec![], settings(fast_retry()), None, CancellationToken::new()).await;
        assert_eq!(run.result().outcome, WorkflowOutcome::Completed);
        assert_eq!(run.result().waves_completed, 0);
    }
}
