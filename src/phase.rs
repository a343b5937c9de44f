//! Phase definitions, graph-file loading and the phase registry.
//!
//! This module provides:
//! - `PhaseCommand`: the opaque invocation behind a phase (program, args, working dir)
//! - `Phase`: an immutable, fully-resolved phase declaration
//! - `PhasesFile`: the on-disk phase-graph format (JSON, TOML or YAML)
//! - `PhaseRegistry`: the validated set of phases shared by every other component

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::WorkflowError;

/// Timeout used by `Phase::new` when nothing else is configured.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(3600);

/// An invocable unit: binary path, arguments, working directory and extra environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl PhaseCommand {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Run a script through `sh -c`.
    pub fn shell(script: &str) -> Self {
        Self::new("sh", ["-c", script])
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Resolve the working directory against a base directory.
    pub fn resolve_working_dir(&self, base: &Path) -> PathBuf {
        match &self.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => base.join(dir),
            None => base.to_path_buf(),
        }
    }

    /// Human-readable command line, for logs and reports.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(char::is_whitespace) {
                line.push_str(&format!("{:?}", arg));
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Command as written in a graph file: a shell string or a structured invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Exec(PhaseCommand),
}

impl From<CommandSpec> for PhaseCommand {
    fn from(spec: CommandSpec) -> Self {
        match spec {
            CommandSpec::Shell(script) => PhaseCommand::shell(&script),
            CommandSpec::Exec(command) => command,
        }
    }
}

/// A single named unit of work. Immutable once placed in a `PhaseRegistry`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    /// Unique phase id
    pub id: String,
    /// Optional human-readable description
    #[serde(default)]
    pub description: String,
    /// Ids of the phases that must succeed before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// What to run
    pub command: PhaseCommand,
    /// Wall-clock limit for one attempt
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Whether an application failure may be retried
    pub retryable: bool,
    /// Whether the produced artifact must pass the quality gate
    pub quality_gated: bool,
    /// Artifact scored by the quality gate (relative to the working dir); stdout if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PathBuf>,
    /// Designated sub-command for quality regeneration attempts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regenerate: Option<PhaseCommand>,
    /// Per-phase override of the retry budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Phase {
    pub fn new(id: &str, command: PhaseCommand) -> Self {
        Self {
            id: id.to_string(),
            description: String::new(),
            dependencies: Vec::new(),
            command,
            timeout: DEFAULT_PHASE_TIMEOUT,
            retryable: true,
            quality_gated: false,
            artifact: None,
            regenerate: None,
            max_attempts: None,
        }
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dedup(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_quality_gate(mut self, gated: bool) -> Self {
        self.quality_gated = gated;
        self
    }

    pub fn with_artifact(mut self, artifact: impl Into<PathBuf>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    pub fn with_regenerate(mut self, command: PhaseCommand) -> Self {
        self.regenerate = Some(command);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Command to run for a quality regeneration attempt.
    pub fn regeneration_command(&self) -> &PhaseCommand {
        self.regenerate.as_ref().unwrap_or(&self.command)
    }
}

fn dedup(ids: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(id.clone())).collect()
}

/// Values applied to phases whose definition leaves them unset.
#[derive(Debug, Clone)]
pub struct PhaseDefaults {
    pub timeout: Duration,
}

impl Default for PhaseDefaults {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PHASE_TIMEOUT,
        }
    }
}

/// One phase as declared in a graph file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<String>,
    pub command: CommandSpec,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_retryable")]
    pub retryable: bool,
    #[serde(default)]
    pub quality_gated: bool,
    #[serde(default)]
    pub artifact: Option<PathBuf>,
    #[serde(default)]
    pub regenerate: Option<CommandSpec>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_retryable() -> bool {
    true
}

impl PhaseDefinition {
    pub fn into_phase(self, defaults: &PhaseDefaults) -> Phase {
        Phase {
            id: self.id,
            description: self.description,
            dependencies: dedup(self.depends_on.into_iter()),
            command: self.command.into(),
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            retryable: self.retryable,
            quality_gated: self.quality_gated,
            artifact: self.artifact,
            regenerate: self.regenerate.map(Into::into),
            max_attempts: self.max_attempts,
        }
    }
}

/// The phase-graph file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhasesFile {
    /// Optional workflow name
    #[serde(default)]
    pub name: Option<String>,
    /// Declared phases, in declaration order
    pub phases: Vec<PhaseDefinition>,
}

/// Serialization format of a phase-graph file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Json,
    Toml,
    Yaml,
}

impl GraphFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(GraphFormat::Json),
            Some("toml") => Ok(GraphFormat::Toml),
            Some("yaml") | Some("yml") => Ok(GraphFormat::Yaml),
            other => bail!(
                "Unsupported phase graph extension {:?} for {}. Use .json, .toml, .yaml or .yml",
                other.unwrap_or(""),
                path.display()
            ),
        }
    }
}

impl PhasesFile {
    /// Load a phase graph, picking the parser from the file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let format = GraphFormat::from_path(path)?;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read phase graph: {}", path.display()))?;
        Self::parse(&content, format)
            .with_context(|| format!("Failed to parse phase graph: {}", path.display()))
    }

    pub fn parse(content: &str, format: GraphFormat) -> Result<Self> {
        let file = match format {
            GraphFormat::Json => serde_json::from_str(content)?,
            GraphFormat::Toml => toml::from_str(content)?,
            GraphFormat::Yaml => serde_yaml::from_str(content)?,
        };
        Ok(file)
    }

    /// Resolve definitions into phases, filling unset values from `defaults`.
    pub fn into_phases(self, defaults: &PhaseDefaults) -> Vec<Phase> {
        self.phases
            .into_iter()
            .map(|d| d.into_phase(defaults))
            .collect()
    }
}

/// The validated, immutable set of phases for one workflow.
///
/// Constructed once at startup and shared by reference; no component mutates it.
#[derive(Debug, Clone)]
pub struct PhaseRegistry {
    phases: Vec<Phase>,
    index: HashMap<String, usize>,
}

impl PhaseRegistry {
    /// Build a registry, rejecting empty ids, duplicate ids and unknown dependencies.
    pub fn new(phases: Vec<Phase>) -> Result<Self, WorkflowError> {
        let mut index = HashMap::with_capacity(phases.len());
        for (i, phase) in phases.iter().enumerate() {
            if phase.id.trim().is_empty() {
                return Err(WorkflowError::EmptyPhaseId);
            }
            if index.insert(phase.id.clone(), i).is_some() {
                return Err(WorkflowError::DuplicatePhase(phase.id.clone()));
            }
        }

        for phase in &phases {
            if let Some(dep) = phase.dependencies.iter().find(|d| !index.contains_key(*d)) {
                return Err(WorkflowError::UnknownDependency {
                    phase: phase.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        Ok(Self { phases, index })
    }

    /// Load and validate a registry from a graph file.
    pub fn load(path: &Path, defaults: &PhaseDefaults) -> Result<Self> {
        let phases = PhasesFile::load(path)?.into_phases(defaults);
        Ok(Self::new(phases)?)
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// All phases, in declaration order.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn get(&self, id: &str) -> Option<&Phase> {
        self.index.get(id).map(|&i| &self.phases[i])
    }

    /// Declaration position of a phase.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }
}

/// Serde helpers for `Duration` as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
