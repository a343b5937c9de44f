//! Diagnostic logging setup.
//!
//! Tracing output is for operators; the manifest remains the audit trail.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// Subscriber settings resolved from config and CLI flags.
#[derive(Debug, Clone, Default)]
pub struct TelemetryOptions<'a> {
    pub verbose: bool,
    pub format: LogFormat,
    /// Also write daily-rotated log files into this directory
    pub file_dir: Option<&'a Path>,
}

fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "phaseflow=debug" } else { "phaseflow=info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. The returned guard flushes the file writer on drop
/// and must be held for the life of the process.
pub fn init(options: TelemetryOptions<'_>) -> Result<Option<WorkerGuard>> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(options.verbose))
        .with_target(false);

    let (file_writer, guard) = match options.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "phaseflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let installed = match (options.format, file_writer) {
        (LogFormat::Pretty, None) => builder.with_writer(std::io::stderr).try_init(),
        (LogFormat::Pretty, Some(file)) => builder
            .with_writer(std::io::stderr.and(file))
            .try_init(),
        (LogFormat::Json, None) => builder.json().with_writer(std::io::stderr).try_init(),
        (LogFormat::Json, Some(file)) => builder
            .json()
            .with_writer(std::io::stderr.and(file))
            .try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))?;

    Ok(guard)
}
