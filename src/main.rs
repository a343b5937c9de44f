use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;

use phaseflow::config::OrchestratorConfig;
use phaseflow::telemetry::{self, LogFormat, TelemetryOptions};

mod cmd;

#[derive(Parser)]
#[command(name = "phaseflow")]
#[command(version, about = "Dependency-ordered phase orchestrator with quality gates")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Config file (defaults to ./phaseflow.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory for run manifests and phase logs. Overrides phaseflow.toml.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Diagnostic log format: pretty or json
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a phase graph
    Run {
        /// Phase graph file (.json, .toml, .yaml)
        graph: PathBuf,
        /// Run identifier (defaults to a timestamp and short uuid)
        #[arg(long)]
        run_id: Option<String>,
        /// Continue an existing run, skipping phases that already succeeded
        #[arg(long)]
        resume: bool,
        /// Maximum concurrent phases per wave
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Abort on the first phase failure, without retries
        #[arg(long)]
        fail_fast: bool,
        /// Default phase timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Validate a phase graph and print its waves
    Plan {
        graph: PathBuf,
    },
    /// Show the latest status of every phase in a run
    Status {
        run_id: String,
    },
    /// Extract the quality score from an artifact
    Score {
        file: PathBuf,
        /// Passing threshold (defaults to quality.threshold)
        #[arg(long)]
        threshold: Option<u8>,
    },
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let base_dir = std::env::current_dir().context("Failed to get current directory")?;

    let mut config = OrchestratorConfig::discover(cli.config.as_deref(), &base_dir)?;
    config.apply_env()?;
    if let Some(dir) = &cli.state_dir {
        config.defaults.state_dir = dir.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    let log_dir = config.state_dir(&base_dir).join("logs");
    let _guard = telemetry::init(TelemetryOptions {
        verbose: cli.verbose,
        format: config.logging.format,
        file_dir: config.logging.file.then_some(log_dir.as_path()),
    })?;

    match cli.command {
        Commands::Run {
            graph,
            run_id,
            resume,
            max_parallel,
            fail_fast,
            timeout,
        } => {
            let options = cmd::RunOptions {
                graph,
                run_id,
                resume,
                max_parallel,
                fail_fast,
                timeout_secs: timeout,
            };
            cmd::cmd_run(config, &base_dir, options).await
        }
        Commands::Plan { graph } => {
            cmd::check_config(&config)?;
            cmd::cmd_plan(&config, &graph)
        }
        Commands::Status { run_id } => {
            cmd::check_config(&config)?;
            cmd::cmd_status(&config, &base_dir, &run_id)
        }
        Commands::Score { file, threshold } => {
            cmd::check_config(&config)?;
            cmd::cmd_score(&config, &file, threshold)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("{} {:#}", style("Error:").red().bold(), e);
            ExitCode::from(1)
        }
    }
}
