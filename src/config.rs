//! Orchestrator configuration loaded from `phaseflow.toml`.
//!
//! Values are layered: file, then `PHASEFLOW_*` environment variables, then CLI flags
//! (applied by the caller on the returned struct). Every field has a default, so an
//! absent or partial file is valid.
//!
//! ```toml
//! [defaults]
//! timeout_secs = 600
//! max_parallel = 4
//!
//! [retry]
//! max_attempts = 2
//! on_exhausted = "abort"
//!
//! [quality]
//! threshold = 7
//! on_exhausted = "regenerate_partial"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gates::{ConfiguredPolicy, MAX_SCORE, QualityDisposition, QualityGate};
use crate::manifest::ManifestOptions;
use crate::orchestrator::{ExhaustedAction, RetryPolicy};
use crate::phase::PhaseDefaults;
use crate::telemetry::LogFormat;

/// Configuration file looked up in the working directory.
pub const CONFIG_FILE: &str = "phaseflow.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Timeout for phases that do not set their own
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Concurrent phases per wave; 0 means unbounded
    #[serde(default)]
    pub max_parallel: usize,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_timeout_secs() -> u64 {
    3600
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".phaseflow")
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_parallel: 0,
            state_dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub workflow_budget: Option<u32>,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub on_exhausted: ExhaustedAction,
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            workflow_budget: None,
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            on_exhausted: ExhaustedAction::default(),
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_threshold")]
    pub threshold: u8,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Regenerations the exhausted-gate policy may spend across the run
    #[serde(default = "default_max_regenerations")]
    pub max_regenerations: u32,
    #[serde(default)]
    pub on_exhausted: QualityDisposition,
}

fn default_threshold() -> u8 {
    crate::gates::DEFAULT_THRESHOLD
}

fn default_max_regenerations() -> u32 {
    1
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            max_attempts: default_max_attempts(),
            max_regenerations: default_max_regenerations(),
            on_exhausted: QualityDisposition::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestConfig {
    #[serde(default)]
    pub fsync: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Also write daily log files under `<state_dir>/logs`
    #[serde(default)]
    pub file: bool,
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid phaseflow.toml")
    }

    /// Load an explicit config path, or `phaseflow.toml` in `dir` if present, or defaults.
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let path = dir.join(CONFIG_FILE);
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Apply `PHASEFLOW_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply `PHASEFLOW_*` overrides read through `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T>(key: &str, value: &str) -> Result<T>
        where
            T: std::str::FromStr,
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", key, value, e))
        }

        if let Some(v) = lookup("PHASEFLOW_TIMEOUT_SECS") {
            self.defaults.timeout_secs = parsed("PHASEFLOW_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("PHASEFLOW_MAX_PARALLEL") {
            self.defaults.max_parallel = parsed("PHASEFLOW_MAX_PARALLEL", &v)?;
        }
        if let Some(v) = lookup("PHASEFLOW_STATE_DIR") {
            self.defaults.state_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PHASEFLOW_QUALITY_THRESHOLD") {
            self.quality.threshold = parsed("PHASEFLOW_QUALITY_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("PHASEFLOW_QUALITY_MAX_ATTEMPTS") {
            self.quality.max_attempts = parsed("PHASEFLOW_QUALITY_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("PHASEFLOW_MAX_ATTEMPTS") {
            self.retry.max_attempts = parsed("PHASEFLOW_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("PHASEFLOW_ON_FAILURE") {
            self.retry.on_exhausted = v.parse()?;
        }
        Ok(())
    }

    /// Check value ranges. Hard errors fail; the returned strings are warnings.
    pub fn validate(&self) -> Result<Vec<String>> {
        if self.quality.threshold > MAX_SCORE {
            anyhow::bail!(
                "quality.threshold must be between 0 and {}, got {}",
                MAX_SCORE,
                self.quality.threshold
            );
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.quality.max_attempts == 0 {
            anyhow::bail!("quality.max_attempts must be at least 1");
        }

        if self.defaults.timeout_secs == 0 {
            anyhow::bail!("defaults.timeout_secs must be at least 1");
        }

        let mut warnings = Vec::new();
        if self.quality.threshold == 0 {
            warnings.push("quality.threshold is 0; every artifact passes".to_string());
        }
        if self.retry.backoff_ms > self.retry.max_backoff_ms {
            warnings.push(format!(
                "retry.backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.backoff_ms, self.retry.max_backoff_ms
            ));
        }
        if self.retry.fail_fast && self.retry.on_exhausted == ExhaustedAction::Skip {
            warnings.push("retry.fail_fast overrides retry.on_exhausted = \"skip\"".to_string());
        }
        if self.quality.on_exhausted.is_regeneration() && self.quality.max_regenerations == 0 {
            warnings.push(format!(
                "quality.on_exhausted = \"{}\" with max_regenerations = 0 always aborts",
                self.quality.on_exhausted
            ));
        }
        Ok(warnings)
    }

    pub fn phase_defaults(&self) -> PhaseDefaults {
        PhaseDefaults {
            timeout: Duration::from_secs(self.defaults.timeout_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            workflow_budget: self.retry.workflow_budget,
            backoff: Duration::from_millis(self.retry.backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            on_exhausted: self.retry.on_exhausted,
            fail_fast: self.retry.fail_fast,
        }
    }

    pub fn quality_gate(&self) -> QualityGate {
        QualityGate::new(self.quality.threshold, self.quality.max_attempts)
    }

    pub fn quality_policy(&self) -> ConfiguredPolicy {
        ConfiguredPolicy {
            disposition: self.quality.on_exhausted,
            max_regenerations: self.quality.max_regenerations,
        }
    }

    pub fn manifest_options(&self) -> ManifestOptions {
        ManifestOptions {
            fsync: self.manifest.fsync,
        }
    }

    /// `None` when unbounded.
    pub fn max_parallel(&self) -> Option<usize> {
        (self.defaults.max_parallel > 0).then_some(self.defaults.max_parallel)
    }

    /// State directory, resolved against `base` when relative.
    pub fn state_dir(&self, base: &Path) -> PathBuf {
        if self.defaults.state_dir.is_absolute() {
            self.defaults.state_dir.clone()
        } else {
            base.join(&self.defaults.state_dir)
        }
    }

    /// Directory holding one run's manifest and phase logs.
    pub fn run_dir(&self, base: &Path, run_id: &str) -> PathBuf {
        self.state_dir(base).join("runs").join(run_id)
    }
}
