//! Append-only workflow manifest.
//!
//! The manifest is a line-delimited JSON file with one entry per phase lifecycle
//! transition. It is the only record of workflow history: reporting and resumption
//! both work by replaying it.
//!
//! ```text
//! {"phase":"build","status":"started","exit_code":null,"duration_seconds":null,"timestamp":"2026-01-01T00:00:00Z","attempt":1,"wave":0}
//! {"phase":"build","status":"success","exit_code":0,"duration_seconds":1.25,"timestamp":"2026-01-01T00:00:01.25Z","attempt":1,"wave":0}
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::dag::{FailureClass, PhaseRun};
use crate::gates::GateDecision;

pub mod logger;
pub use logger::{ManifestHandle, ManifestLogger, ManifestOptions};

/// Status column of a manifest line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestStatus {
    Started,
    Success,
    Failed,
    Timeout,
    Skipped,
}

impl ManifestStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality-gate details attached to a gate decision entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityRecord {
    pub score: u8,
    pub threshold: u8,
    pub attempt: u32,
    pub max_attempts: u32,
    pub decision: GateDecision,
}

/// One manifest line. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub phase: String,
    pub status: ManifestStatus,
    pub exit_code: Option<i32>,
    pub duration_seconds: Option<f64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wave: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityRecord>,
}

impl ManifestEntry {
    fn bare(phase: &str, status: ManifestStatus) -> Self {
        Self {
            phase: phase.to_string(),
            status,
            exit_code: None,
            duration_seconds: None,
            timestamp: Utc::now(),
            attempt: None,
            wave: None,
            failure: None,
            reason: None,
            quality: None,
        }
    }

    /// Entry written immediately before a phase's process is launched.
    pub fn started(phase: &str, attempt: u32, wave: usize) -> Self {
        Self {
            attempt: Some(attempt),
            wave: Some(wave),
            ..Self::bare(phase, ManifestStatus::Started)
        }
    }

    /// Terminal entry for a finished run.
    pub fn from_run(run: &PhaseRun, wave: usize) -> Self {
        Self {
            exit_code: run.exit_code,
            duration_seconds: Some(run.duration.as_secs_f64()),
            attempt: Some(run.attempt),
            wave: Some(wave),
            failure: run.failure,
            reason: run.error.clone(),
            ..Self::bare(&run.phase_id, run.status.manifest_status())
        }
    }

    /// A phase that was never launched, or was dropped after exhausting its attempts.
    pub fn skipped(phase: &str, wave: usize, reason: &str) -> Self {
        Self {
            wave: Some(wave),
            reason: Some(reason.to_string()),
            ..Self::bare(phase, ManifestStatus::Skipped)
        }
    }

    /// Records a quality-gate decision.
    pub fn quality(phase: &str, wave: usize, record: QualityRecord, reason: &str) -> Self {
        let status = if record.decision.accepts() {
            ManifestStatus::Success
        } else {
            ManifestStatus::Failed
        };
        Self {
            wave: Some(wave),
            attempt: Some(record.attempt),
            reason: Some(reason.to_string()),
            quality: Some(record),
            ..Self::bare(phase, status)
        }
    }

    /// Serialize to a single JSON line (without the trailing newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Result of scanning a manifest from the start.
#[derive(Debug, Clone, Default)]
pub struct ManifestReplay {
    /// Every parseable entry, in file order
    pub entries: Vec<ManifestEntry>,
    /// Lines that could not be parsed (a torn final write, for instance)
    pub skipped_lines: usize,
    latest: HashMap<String, usize>,
    order: Vec<String>,
}

impl ManifestReplay {
    fn push(&mut self, entry: ManifestEntry) {
        let idx = self.entries.len();
        if self.latest.insert(entry.phase.clone(), idx).is_none() {
            self.order.push(entry.phase.clone());
        }
        self.entries.push(entry);
    }

    /// Build a replay from entries already in memory.
    pub fn from_entries(entries: impl IntoIterator<Item = ManifestEntry>) -> Self {
        let mut replay = Self::default();
        for entry in entries {
            replay.push(entry);
        }
        replay
    }

    /// The last entry recorded for a phase.
    pub fn latest(&self, phase: &str) -> Option<&ManifestEntry> {
        self.latest.get(phase).map(|&i| &self.entries[i])
    }

    /// Latest entry of every phase, in order of first appearance.
    pub fn latest_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.order.iter().filter_map(|p| self.latest(p))
    }

    /// Phases whose latest status is `success`.
    pub fn succeeded_phases(&self) -> Vec<String> {
        self.latest_entries()
            .filter(|e| e.status == ManifestStatus::Success)
            .map(|e| e.phase.clone())
            .collect()
    }

    /// Whether a phase's latest entry is a gate decision that accepted its artifact.
    pub fn gate_accepted(&self, phase: &str) -> bool {
        self.latest(phase)
            .and_then(|e| e.quality.as_ref())
            .is_some_and(|q| q.decision.accepts())
    }

    /// Count of phases whose latest status equals `status`.
    pub fn count_latest(&self, status: ManifestStatus) -> usize {
        self.latest_entries().filter(|e| e.status == status).count()
    }

    /// Most recent terminal entry of a process launch for a phase. Skip records and
    /// gate decisions are ignored.
    pub fn latest_terminal_run(&self, phase: &str) -> Option<&ManifestEntry> {
        self.entries.iter().rev().find(|e| {
            e.phase == phase && e.status.is_terminal() && e.attempt.is_some() && e.quality.is_none()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Scan a manifest file and keep the last entry per phase.
///
/// Unparseable lines are counted and skipped, never fatal: a crash mid-append can
/// leave a torn final line, and every earlier line is still valid.
pub fn replay(path: &Path) -> Result<ManifestReplay> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open manifest: {}", path.display()))?;
    let mut replay = ManifestReplay::default();

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ManifestEntry>(&line) {
            Ok(entry) => replay.push(entry),
            Err(e) => {
                tracing::warn!(
                    manifest = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping unparseable manifest line"
                );
                replay.skipped_lines += 1;
            }
        }
    }

    Ok(replay)
}
