use crate::session::{SessionId, SessionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One crash reported by the engine, in the order it was printed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CrashDescriptor {
    /// Sanitizer/engine classification, e.g. `heap-buffer-overflow`.
    pub crash_type: String,
    /// Free-form location text following the classification; may be empty.
    pub location: String,
}

/// A crashing input the engine persisted in the session's crash directory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CrashArtifact {
    pub path: PathBuf,
    /// Hex MD5 of the artifact contents.
    pub md5: String,
    pub size: u64,
    /// Set when minimization was requested for the run and succeeded.
    #[serde(default)]
    pub minimized_path: Option<PathBuf>,
}

impl CrashArtifact {
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            md5: format!("{:x}", md5::compute(&bytes)),
            size: bytes.len() as u64,
            minimized_path: None,
        })
    }
}

/// Outcome of one fuzzing session. Built once when the run ends and never
/// mutated by the core afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineResult {
    pub session_id: SessionId,
    pub engine: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub executions: u64,
    /// Latest coverage counter the engine reported (edges/features).
    pub coverage: u64,
    pub crashes: Vec<CrashDescriptor>,
    pub crash_artifacts: Vec<CrashArtifact>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// Filled when coverage generation was requested for the run.
    #[serde(default)]
    pub coverage_report: Option<CoverageInfo>,
}

impl EngineResult {
    pub fn crash_count(&self) -> usize {
        self.crashes.len()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn execs_per_sec(&self) -> f64 {
        let secs = self.duration().as_secs_f64();
        if secs > 0.0 {
            self.executions as f64 / secs
        } else {
            0.0
        }
    }

    pub fn found_crashes(&self) -> bool {
        !self.crashes.is_empty() || !self.crash_artifacts.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ReproductionResult {
    /// A non-zero exit reproduces the crash.
    pub reproduced: bool,
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr.
    pub output: String,
    pub crash_type: Option<String>,
    pub timed_out: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoverageCounts {
    pub total: u64,
    pub covered: u64,
}

impl CoverageCounts {
    pub fn new(total: u64, covered: u64) -> Self {
        Self { total, covered }
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.covered as f64 * 100.0 / self.total as f64
        }
    }

    pub fn add(&mut self, other: CoverageCounts) {
        self.total += other.total;
        self.covered += other.covered;
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FileCoverage {
    pub lines: CoverageCounts,
    pub functions: CoverageCounts,
    pub branches: CoverageCounts,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct CoverageInfo {
    /// False when the target produced no coverage data (for instance when it
    /// was built without coverage instrumentation). All counters are zero then.
    pub available: bool,
    pub lines: CoverageCounts,
    pub functions: CoverageCounts,
    pub branches: CoverageCounts,
    #[serde(default)]
    pub files: BTreeMap<String, FileCoverage>,
    /// Engine-native payload, kept verbatim for consumers that understand it.
    #[serde(default)]
    pub raw: Option<serde_json::Value>,
}

impl CoverageInfo {
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn line_percent(&self) -> f64 {
        self.lines.percent()
    }

    pub fn function_percent(&self) -> f64 {
        self.functions.percent()
    }

    pub fn branch_percent(&self) -> f64 {
        self.branches.percent()
    }
}
