//! Workflow execution command.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use phaseflow::config::OrchestratorConfig;
use phaseflow::dag::{ExecutorConfig, PhaseExecutor, resolve};
use phaseflow::manifest::ManifestLogger;
use phaseflow::orchestrator::{DriverSettings, WorkflowDriver};
use phaseflow::phase::PhaseRegistry;
use phaseflow::ui::{EventPrinter, print_report};

pub const MANIFEST_FILE: &str = "manifest.jsonl";

/// Flags of the `run` subcommand.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub graph: PathBuf,
    pub run_id: Option<String>,
    pub resume: bool,
    pub max_parallel: Option<usize>,
    pub fail_fast: bool,
    pub timeout_secs: Option<u64>,
}

/// `20261019T140502-1a2b3c4d`
fn generate_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%S"), &suffix[..8])
}

/// Fold CLI flags over file and environment values.
fn apply_flags(config: &mut OrchestratorConfig, options: &RunOptions) {
    if let Some(secs) = options.timeout_secs {
        config.defaults.timeout_secs = secs;
    }
    if let Some(n) = options.max_parallel {
        config.defaults.max_parallel = n;
    }
    if options.fail_fast {
        config.retry.fail_fast = true;
    }
}

pub async fn cmd_run(
    mut config: OrchestratorConfig,
    base_dir: &Path,
    options: RunOptions,
) -> Result<i32> {
    apply_flags(&mut config, &options);
    super::check_config(&config)?;

    let registry = PhaseRegistry::load(&options.graph, &config.phase_defaults())?;
    resolve(&registry).context("Invalid phase graph")?;

    let run_id = match (&options.run_id, options.resume) {
        (Some(id), _) => id.clone(),
        (None, true) => anyhow::bail!("--resume requires --run-id"),
        (None, false) => generate_run_id(),
    };

    let run_dir = config.run_dir(base_dir, &run_id);
    let manifest_path = run_dir.join(MANIFEST_FILE);
    match (options.resume, manifest_path.exists()) {
        (false, true) => anyhow::bail!(
            "Run '{}' already exists at {}; pass --resume to continue it",
            run_id,
            run_dir.display()
        ),
        (true, false) => anyhow::bail!(
            "Cannot resume run '{}': no manifest at {}",
            run_id,
            manifest_path.display()
        ),
        _ => {}
    }

    let logger = ManifestLogger::open(&manifest_path, config.manifest_options())?;
    tracing::info!(
        run_id = %run_id,
        phases = registry.len(),
        manifest = %manifest_path.display(),
        "Starting workflow"
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(EventPrinter::new(rx).run());

    let executor = PhaseExecutor::new(
        ExecutorConfig::new(base_dir, run_dir.join("logs"))
            .with_max_parallel(config.max_parallel())
            .with_run_id(&run_id),
        logger.handle(),
    )
    .with_event_channel(tx);

    let settings = DriverSettings {
        run_id: run_id.clone(),
        retry: config.retry_policy(),
        gate: config.quality_gate(),
        resume: options.resume,
    };
    let mut driver =
        WorkflowDriver::new(registry, executor, settings).with_policy(config.quality_policy());

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received; cancelling running phases");
                cancel.cancel();
            }
        })
    };

    let result = driver.run(&cancel).await;

    interrupt.abort();
    drop(driver);
    printer.await.ok();
    logger.close().await;

    let result = result?;
    print_report(&result);
    Ok(result.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_run_ids_are_unique_and_sortable() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), "20261019T140502-1a2b3c4d".len());
        assert!(a.as_bytes()[8] == b'T');
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = OrchestratorConfig::default();
        apply_flags(
            &mut config,
            &RunOptions {
                max_parallel: Some(2),
                fail_fast: true,
                timeout_secs: Some(5),
                ..RunOptions::default()
            },
        );
        assert_eq!(config.max_parallel(), Some(2));
        assert!(config.retry.fail_fast);
        assert_eq!(config.defaults.timeout_secs, 5);
    }

    #[tokio::test]
    async fn test_flags_are_validated() {
        let dir = tempfile::TempDir::new().unwrap();
        let graph = dir.path().join("graph.json");
        std::fs::write(&graph, r#"{"phases": [{"id": "a", "command": "true"}]}"#).unwrap();

        let err = cmd_run(
            OrchestratorConfig::default(),
            dir.path(),
            RunOptions {
                graph,
                run_id: Some("r".into()),
                timeout_secs: Some(0),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("timeout_secs"));
        assert!(!dir.path().join(".phaseflow/runs/r").exists());
    }
}
