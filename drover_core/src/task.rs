use crate::config::DroverConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// A fuzzing job already assigned to this host.
///
/// Owned by the caller and never modified by the core.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct FuzzingTask {
    pub target_path: PathBuf,
    /// Extra arguments, appended after every engine default so they can
    /// override them.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub corpus_path: Option<PathBuf>,
    /// Wall-clock budget in milliseconds; the config default applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    /// Empty selects the preferred available engine.
    #[serde(default)]
    pub engine: String,
    #[serde(default)]
    pub engine_options: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub enable_coverage: bool,
    #[serde(default)]
    pub enable_minimization: bool,
    /// Stop the run once this many crashes were seen. 0 means unlimited.
    #[serde(default)]
    pub max_crashes: Option<usize>,
}

impl FuzzingTask {
    pub fn new(target_path: impl Into<PathBuf>) -> Self {
        Self {
            target_path: target_path.into(),
            ..Self::default()
        }
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_corpus(mut self, corpus_path: impl Into<PathBuf>) -> Self {
        self.corpus_path = Some(corpus_path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_memory_limit_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.engine_options.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_max_crashes(mut self, max: usize) -> Self {
        self.max_crashes = Some(max);
        self
    }

    pub fn with_coverage(mut self, enabled: bool) -> Self {
        self.enable_coverage = enabled;
        self
    }

    pub fn with_minimization(mut self, enabled: bool) -> Self {
        self.enable_minimization = enabled;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn effective_timeout(&self, config: &DroverConfig) -> Duration {
        self.timeout().unwrap_or_else(|| config.default_timeout())
    }

    pub fn effective_memory_limit_mb(&self, config: &DroverConfig) -> u64 {
        self.memory_limit_mb
            .unwrap_or(config.default_memory_limit_mb)
    }

    /// `None` when crashes are not capped.
    pub fn crash_cutoff(&self, config: &DroverConfig) -> Option<usize> {
        match self.max_crashes.unwrap_or(config.max_crashes_per_session) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn wants_coverage(&self, config: &DroverConfig) -> bool {
        self.enable_coverage || config.enable_coverage
    }

    pub fn has_explicit_engine(&self) -> bool {
        !self.engine.trim().is_empty()
    }
}
