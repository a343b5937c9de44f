//! Wave executor: runs one batch of phases as concurrent child processes.
//!
//! Each phase gets its own waiter task that owns the child, races its exit against
//! the phase timeout and the cancellation token, and reports back over a results
//! channel. Slow siblings never delay the recording of a fast phase: its terminal
//! manifest entry is written as soon as its own process exits.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dag::state::{ExecutionTimer, OutputRef, PhaseRun, WaveReport};
use crate::errors::{PhaseError, WorkflowError};
use crate::manifest::{ManifestEntry, ManifestHandle};
use crate::phase::{Phase, PhaseCommand};

/// Events emitted while a wave runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PhaseEvent {
    /// A wave of phases has been handed to the executor.
    WaveStarted { wave: usize, phases: Vec<String> },
    /// A phase's process was launched.
    Started {
        phase: String,
        wave: usize,
        attempt: u32,
    },
    /// A phase reached a terminal status.
    Completed { phase: String, run: Box<PhaseRun> },
    /// Every phase handed to the wave has reported.
    WaveCompleted {
        wave: usize,
        succeeded: usize,
        failed: usize,
    },
}

/// Why a phase is being launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Initial,
    Retry,
    Regeneration,
}

/// One phase launch request.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub phase: Phase,
    pub attempt: u32,
    pub kind: InvocationKind,
}

impl Invocation {
    pub fn initial(phase: &Phase) -> Self {
        Self {
            phase: phase.clone(),
            attempt: 1,
            kind: InvocationKind::Initial,
        }
    }

    pub fn retry(phase: &Phase, attempt: u32) -> Self {
        Self {
            phase: phase.clone(),
            attempt,
            kind: InvocationKind::Retry,
        }
    }

    pub fn regeneration(phase: &Phase, attempt: u32) -> Self {
        Self {
            phase: phase.clone(),
            attempt,
            kind: InvocationKind::Regeneration,
        }
    }

    /// The command this invocation launches.
    pub fn command(&self) -> &PhaseCommand {
        match self.kind {
            InvocationKind::Regeneration => self.phase.regeneration_command(),
            _ => &self.phase.command,
        }
    }
}

/// Configuration for the wave executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently running phases; `None` runs a whole wave at once
    pub max_parallel: Option<usize>,
    /// Directory phase working directories are resolved against
    pub base_dir: PathBuf,
    /// Directory holding per-phase stdout/stderr files
    pub log_dir: PathBuf,
    /// Exported to every phase as `PHASEFLOW_RUN_ID`
    pub run_id: String,
}

impl ExecutorConfig {
    pub fn new(base_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_parallel: None,
            base_dir: base_dir.into(),
            log_dir: log_dir.into(),
            run_id: String::new(),
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: Option<usize>) -> Self {
        self.max_parallel = max_parallel.filter(|&n| n > 0);
        self
    }

    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = run_id.to_string();
        self
    }
}

/// Launches waves of phases and records their lifecycle in the manifest.
pub struct PhaseExecutor {
    config: ExecutorConfig,
    manifest: ManifestHandle,
    event_tx: Option<mpsc::UnboundedSender<PhaseEvent>>,
}

impl PhaseExecutor {
    pub fn new(config: ExecutorConfig, manifest: ManifestHandle) -> Self {
        Self {
            config,
            manifest,
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::UnboundedSender<PhaseEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn manifest(&self) -> &ManifestHandle {
        &self.manifest
    }

    /// Run a batch of invocations concurrently and wait for all of them.
    ///
    /// Phase failures are captured in the report. Only a manifest write failure is
    /// returned as an error; the remaining phases of the batch are cancelled first.
    pub async fn run_wave(
        &self,
        wave: usize,
        invocations: Vec<Invocation>,
        cancel: &CancellationToken,
    ) -> Result<WaveReport, WorkflowError> {
        let timer = ExecutionTimer::start();
        let mut report = WaveReport::new(wave);
        if invocations.is_empty() {
            return Ok(report);
        }

        self.emit(PhaseEvent::WaveStarted {
            wave,
            phases: invocations.iter().map(|i| i.phase.id.clone()).collect(),
        });

        if let Err(e) = tokio::fs::create_dir_all(&self.config.log_dir).await {
            // Each phase then fails to open its sinks and is recorded as a launch failure.
            tracing::warn!(dir = %self.config.log_dir.display(), error = %e, "Failed to create log directory");
        }

        let permits = self.config.max_parallel.unwrap_or(invocations.len());
        let semaphore = Arc::new(Semaphore::new(permits.max(1)));
        let wave_cancel = cancel.child_token();
        let (result_tx, mut result_rx) =
            mpsc::channel::<(String, Result<PhaseRun, WorkflowError>)>(invocations.len());
        let mut active: HashMap<String, JoinHandle<()>> = HashMap::new();

        for invocation in invocations {
            let id = invocation.phase.id.clone();
            let semaphore = semaphore.clone();
            let result_tx = result_tx.clone();
            let ctx = PhaseContext {
                wave,
                config: self.config.clone(),
                manifest: self.manifest.clone(),
                cancel: wave_cancel.clone(),
                event_tx: self.event_tx.clone(),
            };

            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let phase_id = invocation.phase.id.clone();
                let result = run_phase(invocation, &ctx).await;
                result_tx.send((phase_id, result)).await.ok();
            });
            active.insert(id, handle);
        }
        drop(result_tx);

        let mut fatal: Option<WorkflowError> = None;
        while let Some((phase_id, result)) = result_rx.recv().await {
            if let Some(handle) = active.remove(&phase_id) {
                handle.await.ok();
            }
            match result {
                Ok(run) => {
                    self.emit(PhaseEvent::Completed {
                        phase: phase_id,
                        run: Box::new(run.clone()),
                    });
                    report.record(run);
                }
                Err(e) => {
                    tracing::error!(phase = %phase_id, error = %e, "Stopping wave after manifest failure");
                    wave_cancel.cancel();
                    fatal.get_or_insert(e);
                }
            }
        }

        // A task that exited without reporting has panicked.
        for (phase_id, handle) in active.drain() {
            if let Err(e) = handle.await {
                tracing::error!(phase = %phase_id, error = %e, "Phase task aborted");
                let mut run = PhaseRun::pending(&phase_id, 0);
                run.fail(
                    crate::dag::FailureClass::Launch,
                    None,
                    format!("phase task aborted: {e}"),
                    std::time::Duration::ZERO,
                );
                report.record(run);
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        report.duration = timer.elapsed();
        self.emit(PhaseEvent::WaveCompleted {
            wave,
            succeeded: report.succeeded(),
            failed: report.failed(),
        });
        Ok(report)
    }

    fn emit(&self, event: PhaseEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).ok();
        }
    }
}

struct PhaseContext {
    wave: usize,
    config: ExecutorConfig,
    manifest: ManifestHandle,
    cancel: CancellationToken,
    event_tx: Option<mpsc::UnboundedSender<PhaseEvent>>,
}

#[tracing::instrument(
    name = "phase",
    skip_all,
    fields(phase = %invocation.phase.id, attempt = invocation.attempt, wave = ctx.wave)
)]
async fn run_phase(invocation: Invocation, ctx: &PhaseContext) -> Result<PhaseRun, WorkflowError> {
    let phase = &invocation.phase;
    let mut run = PhaseRun::pending(&phase.id, invocation.attempt);

    if ctx.cancel.is_cancelled() {
        run.skip("workflow cancelled before launch");
        ctx.manifest
            .append(ManifestEntry::skipped(&phase.id, ctx.wave, "workflow cancelled before launch"))
            .await?;
        return Ok(run);
    }

    ctx.manifest
        .append(ManifestEntry::started(&phase.id, invocation.attempt, ctx.wave))
        .await?;
    run.start();
    if let Some(ref tx) = ctx.event_tx {
        tx.send(PhaseEvent::Started {
            phase: phase.id.clone(),
            wave: ctx.wave,
            attempt: invocation.attempt,
        })
        .ok();
    }

    let output = output_paths(&ctx.config.log_dir, &phase.id, invocation.attempt);
    run.output = Some(output.clone());

    tracing::debug!(command = %invocation.command().display(), kind = ?invocation.kind, "Launching phase");
    let timer = ExecutionTimer::start();
    match supervise(&invocation, ctx, &output).await {
        Ok(()) => {
            run.succeed(timer.elapsed());
            tracing::info!(duration_ms = run.duration.as_millis() as u64, "Phase succeeded");
        }
        Err(e) => {
            run.fail(e.class(), e.exit_code(), e.to_string(), timer.elapsed());
            tracing::warn!(class = %e.class(), exit_code = ?run.exit_code, error = %e, "Phase failed");
        }
    }

    ctx.manifest
        .append(ManifestEntry::from_run(&run, ctx.wave))
        .await?;
    Ok(run)
}

enum Interrupt {
    Timeout,
    Cancelled,
}

async fn supervise(
    invocation: &Invocation,
    ctx: &PhaseContext,
    output: &OutputRef,
) -> Result<(), PhaseError> {
    let phase = &invocation.phase;
    let command = invocation.command();
    let stdout = open_sink(&phase.id, &output.stdout)?;
    let stderr = open_sink(&phase.id, &output.stderr)?;

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(command.resolve_working_dir(&ctx.config.base_dir))
        .envs(&command.env)
        .env("PHASEFLOW_PHASE", &phase.id)
        .env("PHASEFLOW_ATTEMPT", invocation.attempt.to_string())
        .env("PHASEFLOW_RUN_ID", &ctx.config.run_id)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .kill_on_drop(true);
    // One process group per phase, signalled as a whole on timeout and cancel
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| PhaseError::SpawnFailed {
        phase: phase.id.clone(),
        source,
    })?;

    let interrupt = tokio::select! {
        status = child.wait() => return classify(&phase.id, status),
        _ = tokio::time::sleep(phase.timeout) => Interrupt::Timeout,
        _ = ctx.cancel.cancelled() => Interrupt::Cancelled,
    };

    terminate(&phase.id, &mut child).await;
    match interrupt {
        Interrupt::Timeout => Err(PhaseError::Timeout {
            phase: phase.id.clone(),
            timeout: phase.timeout,
        }),
        Interrupt::Cancelled => Err(PhaseError::Cancelled {
            phase: phase.id.clone(),
        }),
    }
}

fn classify(phase: &str, status: std::io::Result<ExitStatus>) -> Result<(), PhaseError> {
    let status = status.map_err(|source| PhaseError::SpawnFailed {
        phase: phase.to_string(),
        source,
    })?;
    match status.code() {
        Some(0) => Ok(()),
        Some(crate::dag::TIMEOUT_EXIT_CODE) => Err(PhaseError::TimeoutExit {
            phase: phase.to_string(),
            exit_code: crate::dag::TIMEOUT_EXIT_CODE,
        }),
        Some(exit_code) => Err(PhaseError::Application {
            phase: phase.to_string(),
            exit_code,
        }),
        None => Err(PhaseError::Signaled {
            phase: phase.to_string(),
        }),
    }
}

/// Kill the phase's whole process group, then reap the direct child.
async fn terminate(phase: &str, child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: killpg has no memory-safety preconditions; the group id is the
        // child's pid because it was spawned with `process_group(0)`.
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc == 0 {
            if let Err(e) = child.wait().await {
                tracing::warn!(phase, error = %e, "Failed to reap phase process");
            }
            return;
        }
        tracing::warn!(
            phase,
            error = %std::io::Error::last_os_error(),
            "Failed to signal phase process group"
        );
    }
    if let Err(e) = child.kill().await {
        tracing::warn!(phase, error = %e, "Failed to kill phase process");
    }
}

fn open_sink(phase: &str, path: &Path) -> Result<File, PhaseError> {
    File::create(path).map_err(|source| PhaseError::OutputCapture {
        phase: phase.to_string(),
        path: path.to_path_buf(),
        source,
    })
}

/// Per-attempt output files for a phase. Ids are sanitized for use as file names.
pub fn output_paths(log_dir: &Path, phase_id: &str, attempt: u32) -> OutputRef {
    let stem: String = phase_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    OutputRef {
        stdout: log_dir.join(format!("{stem}.attempt-{attempt}.stdout.log")),
        stderr: log_dir.join(format!("{stem}.attempt-{attempt}.stderr.log")),
    }
}
