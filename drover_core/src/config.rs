use crate::error::EngineError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LibFuzzerSettings {
    /// Command used to probe the toolchain; the first version-looking token of
    /// its output becomes the engine version.
    #[serde(default = "default_libfuzzer_probe")]
    pub probe_command: Vec<String>,
    #[serde(default = "default_minimize_runs")]
    pub minimize_runs: u64,
}

fn default_libfuzzer_probe() -> Vec<String> {
    vec!["clang".to_string(), "--version".to_string()]
}

fn default_minimize_runs() -> u64 {
    10_000
}

impl Default for LibFuzzerSettings {
    fn default() -> Self {
        Self {
            probe_command: default_libfuzzer_probe(),
            minimize_runs: default_minimize_runs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct AflSettings {
    #[serde(default = "default_afl_fuzz_path")]
    pub afl_fuzz_path: PathBuf,
    #[serde(default = "default_afl_tmin_path")]
    pub afl_tmin_path: PathBuf,
    #[serde(default = "default_afl_showmap_path")]
    pub afl_showmap_path: PathBuf,
    #[serde(default = "default_afl_probe")]
    pub probe_command: Vec<String>,
}

fn default_afl_fuzz_path() -> PathBuf {
    PathBuf::from("afl-fuzz")
}

fn default_afl_tmin_path() -> PathBuf {
    PathBuf::from("afl-tmin")
}

fn default_afl_showmap_path() -> PathBuf {
    PathBuf::from("afl-showmap")
}

fn default_afl_probe() -> Vec<String> {
    vec!["afl-fuzz".to_string(), "-h".to_string()]
}

impl Default for AflSettings {
    fn default() -> Self {
        Self {
            afl_fuzz_path: default_afl_fuzz_path(),
            afl_tmin_path: default_afl_tmin_path(),
            afl_showmap_path: default_afl_showmap_path(),
            probe_command: default_afl_probe(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EnginesConfig {
    #[serde(default)]
    pub libfuzzer: LibFuzzerSettings,
    #[serde(default)]
    pub afl: AflSettings,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DroverConfig {
    /// Root under which every session gets `<session-id>/{corpus,crashes}`.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Relative task corpus paths are resolved against this directory.
    #[serde(default = "default_corpus_storage_dir")]
    pub corpus_storage_dir: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub default_memory_limit_mb: u64,
    /// 0 means unlimited.
    #[serde(default = "default_max_crashes")]
    pub max_crashes_per_session: usize,
    #[serde(default)]
    pub enable_coverage: bool,
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Slack between the engine's own time budget and the hard kill.
    #[serde(default = "default_deadline_grace_ms")]
    pub deadline_grace_ms: u64,
    /// Deadline for minimize, reproduce and coverage runs.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default)]
    pub engines: EnginesConfig,
}

pub fn default_work_dir() -> PathBuf {
    PathBuf::from("./.drover_work")
}

pub fn default_corpus_storage_dir() -> PathBuf {
    PathBuf::from("./.drover_corpus")
}

pub fn default_timeout_secs() -> u64 {
    3600
}

pub fn default_memory_limit_mb() -> u64 {
    2048
}

pub fn default_max_crashes() -> usize {
    100
}

fn default_session_retention_secs() -> u64 {
    600
}

fn default_probe_timeout_ms() -> u64 {
    5000
}

fn default_deadline_grace_ms() -> u64 {
    2000
}

fn default_operation_timeout_secs() -> u64 {
    300
}

impl DroverConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: DroverConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid config file {:?}: {}", path, e))?;
        Ok(config)
    }

    /// Rejects configurations that would only fail later, deep inside a run.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.work_dir.as_os_str().is_empty() {
            return Err(EngineError::Configuration("work-dir is empty".to_string()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(EngineError::Configuration(
                "probe-timeout-ms must be greater than zero".to_string(),
            ));
        }
        if self.default_timeout_secs == 0 {
            return Err(EngineError::Configuration(
                "default-timeout-secs must be greater than zero".to_string(),
            ));
        }
        for (engine, probe) in [
            ("libfuzzer", &self.engines.libfuzzer.probe_command),
            ("afl", &self.engines.afl.probe_command),
        ] {
            if probe.is_empty() {
                return Err(EngineError::Configuration(format!(
                    "engines.{engine}.probe-command is empty"
                )));
            }
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn deadline_grace(&self) -> Duration {
        Duration::from_millis(self.deadline_grace_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }

    /// Resolves a task corpus path: absolute paths are kept, relative ones live
    /// under the corpus storage root.
    pub fn resolve_corpus_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.corpus_storage_dir.join(path)
        }
    }
}

impl Default for DroverConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            corpus_storage_dir: default_corpus_storage_dir(),
            default_timeout_secs: default_timeout_secs(),
            default_memory_limit_mb: default_memory_limit_mb(),
            max_crashes_per_session: default_max_crashes(),
            enable_coverage: false,
            session_retention_secs: default_session_retention_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            deadline_grace_ms: default_deadline_grace_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
            engines: EnginesConfig::default(),
        }
    }
}
