pub mod afl;
pub mod libfuzzer;

use crate::config::DroverConfig;
use crate::error::EngineError;
use crate::parser::{self, SignalAccumulator};
use crate::process::{CompletedProcess, ProcessCommand, ProcessRunner, RunningProcess, Termination};
use crate::result::{CoverageInfo, CrashArtifact, EngineResult, ReproductionResult};
use crate::session::{SessionId, SessionRegistry, SessionStatus};
use crate::task::FuzzingTask;
use crate::workspace::Workspace;
use chrono::Utc;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

pub use afl::AflBackend;
pub use libfuzzer::LibFuzzerBackend;

/// The closed set of engine families, in default preference order.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    LibFuzzer,
    Afl,
}

impl EngineKind {
    /// In-process engines come first: they pay no fork/exec per execution.
    pub const ALL: [EngineKind; 2] = [EngineKind::LibFuzzer, EngineKind::Afl];

    pub fn name(&self) -> &'static str {
        match self {
            EngineKind::LibFuzzer => "libfuzzer",
            EngineKind::Afl => "afl",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "libfuzzer" => Some(EngineKind::LibFuzzer),
            "afl" | "afl++" | "aflplusplus" => Some(EngineKind::Afl),
            _ => None,
        }
    }

    pub fn is_in_process(&self) -> bool {
        matches!(self, EngineKind::LibFuzzer)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EngineIdentity {
    pub name: String,
    pub version: String,
}

/// What distinguishes one engine family from another: how it is probed, how
/// its command lines look, where it leaves crashing inputs and how its
/// coverage output reads. Everything asynchronous lives in [`Engine`].
pub trait EngineBackend: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Command run to decide availability, from the configured probe argv.
    fn probe_argv<'a>(&self, config: &'a DroverConfig) -> &'a [String];

    /// Hook run after corpus seeding, before launch.
    fn prepare_workspace(&self, _workspace: &Workspace) -> Result<(), EngineError> {
        Ok(())
    }

    fn fuzz_command(
        &self,
        task: &FuzzingTask,
        workspace: &Workspace,
        config: &DroverConfig,
    ) -> ProcessCommand;

    fn minimize_command(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
        output: &Path,
        config: &DroverConfig,
    ) -> ProcessCommand;

    fn reproduce_command(&self, testcase: &Path, target: &Path, args: &[String]) -> ProcessCommand;

    /// `testcase` may be a single input or a directory of inputs. `scratch` is
    /// an empty directory the command may write into.
    fn coverage_command(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
        scratch: &Path,
        config: &DroverConfig,
    ) -> ProcessCommand;

    fn interpret_coverage(&self, completed: &CompletedProcess, scratch: &Path) -> CoverageInfo;

    /// Crashing inputs the engine persisted in the workspace, sorted by path.
    fn crash_artifacts(&self, workspace: &Workspace) -> Vec<PathBuf>;

    /// Reads statistics the engine leaves on disk once it exits.
    fn collect_final_stats(&self, _workspace: &Workspace, _signals: &mut SignalAccumulator) {}

    fn supported_platforms(&self) -> &'static [&'static str];

    /// How inputs can reach the target: `bytes` (in-process), `stdin`, `file`.
    fn supported_formats(&self) -> &'static [&'static str];
}

pub fn backend_for(kind: EngineKind) -> Box<dyn EngineBackend> {
    match kind {
        EngineKind::LibFuzzer => Box::new(LibFuzzerBackend),
        EngineKind::Afl => Box::new(AflBackend),
    }
}

static VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d+\.\d+(?:\.\d+)?[a-z0-9]*)").expect("valid version pattern"));

fn parse_version(output: &str) -> Option<String> {
    VERSION_PATTERN
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Regular files under `dir`, at any depth, sorted.
pub(crate) fn walk_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => pending.push(path),
                Ok(ft) if ft.is_file() => files.push(path),
                _ => {}
            }
        }
    }
    files.sort();
    files
}

/// Runs filesystem work on the blocking pool, off the threads pumping
/// process output.
async fn blocking<T, F>(work: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| EngineError::WorkerFailed(e.to_string()))?
}

fn collect_artifacts(backend: &dyn EngineBackend, workspace: &Workspace) -> Vec<CrashArtifact> {
    backend
        .crash_artifacts(workspace)
        .into_iter()
        .filter_map(|path| match CrashArtifact::from_path(&path) {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                warn!(path = %path.display(), "Unreadable crash artifact: {e}");
                None
            }
        })
        .collect()
}

/// Deadline of a helper process, and the session that owns it when it runs
/// as part of one.
#[derive(Debug, Clone, Copy)]
struct RunScope {
    deadline: Duration,
    session: Option<SessionId>,
}

impl RunScope {
    fn standalone(config: &DroverConfig) -> Self {
        Self {
            deadline: config.operation_timeout(),
            session: None,
        }
    }
}

/// One engine family behind the uniform asynchronous contract.
///
/// Cheap to share: the service wraps each engine in an `Arc` and hands clones
/// to per-operation tasks.
pub struct Engine {
    backend: Arc<dyn EngineBackend>,
    config: RwLock<Arc<DroverConfig>>,
    runner: Arc<ProcessRunner>,
    sessions: Arc<SessionRegistry>,
    version: RwLock<Option<String>>,
}

impl Engine {
    pub fn new(
        kind: EngineKind,
        config: DroverConfig,
        runner: Arc<ProcessRunner>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self::with_backend(backend_for(kind), config, runner, sessions)
    }

    pub fn with_backend(
        backend: Box<dyn EngineBackend>,
        config: DroverConfig,
        runner: Arc<ProcessRunner>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            backend: Arc::from(backend),
            config: RwLock::new(Arc::new(config)),
            runner,
            sessions,
            version: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.backend.kind()
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn identity(&self) -> EngineIdentity {
        EngineIdentity {
            name: self.name().to_string(),
            version: self
                .version
                .read()
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    /// Replaces the shared configuration. Sessions already running keep the
    /// snapshot they started with.
    pub fn initialize(&self, config: DroverConfig) {
        *self.config.write() = Arc::new(config);
    }

    pub fn config(&self) -> Arc<DroverConfig> {
        self.config.read().clone()
    }

    pub fn supported_platforms(&self) -> &'static [&'static str] {
        self.backend.supported_platforms()
    }

    pub fn supported_formats(&self) -> &'static [&'static str] {
        self.backend.supported_formats()
    }

    /// Runs the probe command under the probe timeout. The engine is usable
    /// when the probe launched and finished in time, and either succeeded or
    /// printed something (several engines exit non-zero on `-h`).
    pub async fn is_available(&self) -> bool {
        let config = self.config();
        let Some((program, args)) = self.backend.probe_argv(&config).split_first() else {
            return false;
        };
        let command = ProcessCommand::new(program)
            .args(args)
            .deadline(config.probe_timeout());
        let completed = match self.runner.run_to_completion(command).await {
            Ok(completed) => completed,
            Err(e) => {
                debug!(engine = self.name(), "Probe failed: {e}");
                return false;
            }
        };
        if completed.exit.termination != Termination::Exited {
            debug!(engine = self.name(), "Probe did not finish in time");
            return false;
        }
        let output = completed.combined_output();
        if !completed.exit.success() && output.trim().is_empty() {
            debug!(engine = self.name(), exit = ?completed.exit.exit_code, "Probe failed silently");
            return false;
        }
        let version = parse_version(&output).unwrap_or_else(|| "unknown".to_string());
        *self.version.write() = Some(version);
        true
    }

    /// Registers a new session; the run itself starts with [`Engine::run_session`].
    pub fn open_session(&self) -> SessionId {
        self.sessions.create(self.name())
    }

    pub async fn start_fuzzing(&self, task: &FuzzingTask) -> Result<EngineResult, EngineError> {
        let id = self.open_session();
        self.run_session(id, task).await
    }

    /// Drives an opened session to its end. Pre-flight failures mark the
    /// session `Failed` and are returned as errors; every other ending is a
    /// result.
    pub async fn run_session(
        &self,
        id: SessionId,
        task: &FuzzingTask,
    ) -> Result<EngineResult, EngineError> {
        let outcome = self.drive_session(id, task).await;
        if let Err(e) = &outcome {
            warn!(session = %id, engine = self.name(), "Session failed before completion: {e}");
            self.sessions.finish(id, SessionStatus::Failed);
        }
        outcome
    }

    async fn drive_session(
        &self,
        id: SessionId,
        task: &FuzzingTask,
    ) -> Result<EngineResult, EngineError> {
        let config = self.config();
        let started_at = Utc::now();
        let family = self.kind();

        let backend = Arc::clone(&self.backend);
        let work_dir = config.work_dir.clone();
        let seeds = task
            .corpus_path
            .as_deref()
            .map(|corpus| config.resolve_corpus_path(corpus));
        let workspace = blocking(move || {
            let workspace = Workspace::allocate(&work_dir, id)?;
            if let Some(seeds) = seeds {
                workspace.seed_corpus(&seeds)?;
            }
            backend.prepare_workspace(&workspace)?;
            Ok(workspace)
        })
        .await?;

        let deadline = task.effective_timeout(&config) + config.deadline_grace();
        let command = self
            .backend
            .fuzz_command(task, &workspace, &config)
            .working_dir(
                task.working_dir
                    .clone()
                    .unwrap_or_else(|| workspace.root().to_path_buf()),
            )
            .deadline(deadline);

        let mut signals = SignalAccumulator::new();
        if self.sessions.is_stopping(id) {
            debug!(session = %id, "Stopped before launch");
            self.sessions.finish(id, SessionStatus::Stopped);
            return Ok(self.build_result(id, SessionStatus::Stopped, started_at, signals, Vec::new(), None, None));
        }

        // Everything the session runs, post-processing included, ends by here.
        let deadline_at = Instant::now() + deadline;
        let mut running = self.launch_attached(id, command)?;
        info!(session = %id, engine = self.name(), pid = ?running.handle.pid(), "Fuzzing started");

        let cutoff = task.crash_cutoff(&config);
        let mut cutoff_reached = false;
        while let Some(line) = running.lines.next_line().await {
            trace!(session = %id, "{}", line.text);
            if signals.feed_line(family, &line.text) > 0 {
                debug!(session = %id, crashes = signals.crash_count(), "Crash detected");
            }
            if !cutoff_reached && cutoff.is_some_and(|max| signals.crash_count() >= max) {
                info!(session = %id, crashes = signals.crash_count(), "Crash limit reached, stopping");
                cutoff_reached = true;
                running.handle.cancel();
            }
        }
        let exit = running.exit.wait().await?;

        let status = match exit.termination {
            Termination::TimedOut => SessionStatus::TimedOut,
            Termination::Cancelled if cutoff_reached => SessionStatus::Completed,
            Termination::Cancelled => SessionStatus::Stopped,
            Termination::Exited if exit.exit_code == Some(0) || signals.crash_count() > 0 => {
                SessionStatus::Completed
            }
            Termination::Exited => SessionStatus::Failed,
        };

        let backend = Arc::clone(&self.backend);
        let scanned = workspace.clone();
        let (signals, mut artifacts) = blocking(move || {
            backend.collect_final_stats(&scanned, &mut signals);
            let artifacts = collect_artifacts(backend.as_ref(), &scanned);
            Ok((signals, artifacts))
        })
        .await?;

        if task.enable_minimization {
            let out_dir = workspace.root().join("minimized");
            for artifact in &mut artifacts {
                let Some(scope) = self.session_scope(id, deadline_at, &config) else {
                    warn!(session = %id, "Minimization cut short");
                    break;
                };
                let Some(name) = artifact.path.file_name() else {
                    continue;
                };
                let output = out_dir.join(name);
                match self
                    .minimize_into(&artifact.path, &task.target_path, &task.args, &output, &config, scope)
                    .await
                {
                    Ok(path) => artifact.minimized_path = Some(path),
                    Err(e) => warn!(session = %id, path = %artifact.path.display(), "Minimization skipped: {e}"),
                }
            }
        }

        let coverage_report = if task.wants_coverage(&config) {
            Some(match self.session_scope(id, deadline_at, &config) {
                Some(scope) => {
                    self.coverage_with(workspace.corpus_dir(), &task.target_path, &task.args, &config, scope)
                        .await
                }
                None => {
                    warn!(session = %id, "Coverage skipped, session is over");
                    CoverageInfo::unavailable()
                }
            })
        } else {
            None
        };

        // A stop during post-processing killed it; the session ends stopped.
        let status = if status != SessionStatus::TimedOut && self.sessions.is_stopping(id) {
            SessionStatus::Stopped
        } else {
            status
        };
        // The session keeps its first terminal status; a concurrent cleanup
        // may already have removed it.
        self.sessions.finish(id, status);
        let mut result = self.build_result(
            id,
            status,
            started_at,
            signals,
            artifacts,
            exit.exit_code,
            exit.signal,
        );
        result.coverage_report = coverage_report;
        Ok(result)
    }

    /// Spawns a process owned by session `id`. A process that comes up after
    /// the session was stopped or cleaned up is killed right away.
    fn launch_attached(
        &self,
        id: SessionId,
        command: ProcessCommand,
    ) -> Result<RunningProcess, EngineError> {
        let running = self.runner.spawn(command)?;
        if !self.sessions.attach_process(id, running.handle.clone()) {
            debug!(session = %id, pid = ?running.handle.pid(), "Session is stopping, killing new process");
            running.handle.cancel();
        }
        Ok(running)
    }

    /// Scope for a post-processing step of session `id`, or `None` when the
    /// session is stopping or its deadline has passed.
    fn session_scope(
        &self,
        id: SessionId,
        deadline_at: Instant,
        config: &DroverConfig,
    ) -> Option<RunScope> {
        if self.sessions.is_stopping(id) {
            return None;
        }
        let remaining = deadline_at.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        Some(RunScope {
            deadline: remaining.min(config.operation_timeout()),
            session: Some(id),
        })
    }

    async fn run_scoped(
        &self,
        command: ProcessCommand,
        scope: RunScope,
    ) -> Result<CompletedProcess, EngineError> {
        let command = command.deadline(scope.deadline);
        let running = match scope.session {
            Some(id) => self.launch_attached(id, command)?,
            None => self.runner.spawn(command)?,
        };
        running.collect().await
    }

    #[allow(clippy::too_many_arguments)]
    fn build_result(
        &self,
        id: SessionId,
        status: SessionStatus,
        started_at: chrono::DateTime<Utc>,
        signals: SignalAccumulator,
        crash_artifacts: Vec<CrashArtifact>,
        exit_code: Option<i32>,
        signal: Option<i32>,
    ) -> EngineResult {
        let (executions, coverage, crashes) = signals.into_parts();
        EngineResult {
            session_id: id,
            engine: self.name().to_string(),
            status,
            started_at,
            finished_at: Utc::now(),
            executions,
            coverage,
            crashes,
            crash_artifacts,
            exit_code,
            signal,
            coverage_report: None,
        }
    }

    /// Kills the session's process. Unknown, foreign or finished sessions are
    /// left alone.
    pub fn stop_fuzzing(&self, id: SessionId) {
        let owned = self
            .sessions
            .record(id)
            .is_some_and(|record| record.engine == self.name());
        if !owned {
            debug!(session = %id, engine = self.name(), "Stop ignored for unknown session");
            return;
        }
        if let Some(handle) = self.sessions.request_stop(id) {
            info!(session = %id, engine = self.name(), "Stopping session");
            handle.cancel();
        }
    }

    pub fn fuzzing_status(&self, id: SessionId) -> SessionStatus {
        match self.sessions.record(id) {
            Some(record) if record.engine == self.name() => record.status,
            _ => SessionStatus::Unknown,
        }
    }

    /// Process-based engines cannot suspend a run.
    pub fn pause_fuzzing(&self, _id: SessionId) -> Result<(), EngineError> {
        Err(EngineError::UnsupportedOperation {
            engine: self.name().to_string(),
            operation: "pause",
        })
    }

    /// Minimizes `testcase` into a fresh file under `<work_dir>/minimized`.
    pub async fn minimize_test_case(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
    ) -> Result<PathBuf, EngineError> {
        let config = self.config();
        let name = testcase
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "testcase".to_string());
        let output = config
            .work_dir
            .join("minimized")
            .join(format!("{}-{name}", SessionId::new()));
        let scope = RunScope::standalone(&config);
        self.minimize_into(testcase, target, args, &output, &config, scope)
            .await
    }

    async fn minimize_into(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
        output: &Path,
        config: &DroverConfig,
        scope: RunScope,
    ) -> Result<PathBuf, EngineError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::workspace(parent, e))?;
        }
        let command = self
            .backend
            .minimize_command(testcase, target, args, output, config);
        let completed = self.run_scoped(command, scope).await?;

        match completed.exit.termination {
            Termination::TimedOut => {
                return Err(EngineError::MinimizationFailed(format!(
                    "timed out after {:?}",
                    completed.exit.elapsed
                )));
            }
            Termination::Cancelled => {
                return Err(EngineError::MinimizationFailed("cancelled".to_string()));
            }
            Termination::Exited if !completed.exit.success() => {
                return Err(EngineError::MinimizationFailed(format!(
                    "{} exited with {:?}",
                    self.name(),
                    completed.exit.exit_code
                )));
            }
            Termination::Exited => {}
        }
        let produced = tokio::fs::metadata(output)
            .await
            .is_ok_and(|metadata| metadata.is_file());
        if !produced {
            return Err(EngineError::MinimizationFailed(format!(
                "no minimized artifact at {}",
                output.display()
            )));
        }
        debug!(engine = self.name(), output = %output.display(), "Minimized test case");
        Ok(output.to_path_buf())
    }

    /// Runs the target once on `testcase`. A non-zero exit reproduces.
    pub async fn reproduce_crash(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
    ) -> Result<ReproductionResult, EngineError> {
        let config = self.config();
        let command = self
            .backend
            .reproduce_command(testcase, target, args)
            .deadline(config.operation_timeout());
        let completed = self
            .runner
            .run_to_completion(command)
            .await
            .map_err(|e| EngineError::ReproductionFailed(e.to_string()))?;

        let output = completed.combined_output();
        let timed_out = completed.exit.termination == Termination::TimedOut;
        let reproduced =
            completed.exit.termination == Termination::Exited && completed.exit.exit_code != Some(0);
        Ok(ReproductionResult {
            reproduced,
            exit_code: completed.exit.exit_code,
            crash_type: parser::crash_type_from_output(self.kind(), &output),
            output,
            timed_out,
        })
    }

    /// Never fails: anything short of usable coverage output is reported as
    /// unavailable.
    pub async fn generate_coverage(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
    ) -> CoverageInfo {
        let config = self.config();
        let scope = RunScope::standalone(&config);
        self.coverage_with(testcase, target, args, &config, scope)
            .await
    }

    async fn coverage_with(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
        config: &DroverConfig,
        scope: RunScope,
    ) -> CoverageInfo {
        if let Err(e) = tokio::fs::create_dir_all(&config.work_dir).await {
            warn!(engine = self.name(), "Coverage unavailable, no work dir: {e}");
            return CoverageInfo::unavailable();
        }
        let work_dir = config.work_dir.clone();
        let scratch = match blocking(move || {
            tempfile::Builder::new()
                .prefix("coverage-")
                .tempdir_in(&work_dir)
                .map_err(|e| EngineError::workspace(&work_dir, e))
        })
        .await
        {
            Ok(dir) => dir,
            Err(e) => {
                warn!(engine = self.name(), "Coverage unavailable, no scratch dir: {e}");
                return CoverageInfo::unavailable();
            }
        };
        let command = self
            .backend
            .coverage_command(testcase, target, args, scratch.path(), config);
        let completed = match self.run_scoped(command, scope).await {
            Ok(completed) if completed.exit.termination == Termination::Exited => completed,
            Ok(completed) => {
                warn!(engine = self.name(), termination = ?completed.exit.termination, "Coverage run did not finish");
                return CoverageInfo::unavailable();
            }
            Err(e) => {
                warn!(engine = self.name(), "Coverage run failed: {e}");
                return CoverageInfo::unavailable();
            }
        };
        let backend = Arc::clone(&self.backend);
        blocking(move || Ok(backend.interpret_coverage(&completed, scratch.path())))
            .await
            .unwrap_or_else(|e| {
                warn!(engine = self.name(), "Coverage unavailable: {e}");
                CoverageInfo::unavailable()
            })
    }

    /// Kills every live session of this engine and forgets all of its
    /// sessions.
    pub fn cleanup(&self) {
        let live = self.sessions.live_sessions(self.name());
        if !live.is_empty() {
            info!(engine = self.name(), sessions = ?live, "Killing remaining sessions");
        }
        for handle in self.sessions.drain_engine(self.name()) {
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_target;
    use std::time::{Duration, Instant};
    use tempfile::{TempDir, tempdir};

    fn test_config(work: &TempDir) -> DroverConfig {
        DroverConfig {
            work_dir: work.path().join("work"),
            corpus_storage_dir: work.path().join("corpora"),
            deadline_grace_ms: 0,
            operation_timeout_secs: 10,
            ..DroverConfig::default()
        }
    }

    fn engine(kind: EngineKind, config: DroverConfig) -> (Engine, Arc<ProcessRunner>, Arc<SessionRegistry>) {
        let runner = Arc::new(ProcessRunner::with_drain_grace(Duration::from_millis(200)));
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
        let engine = Engine::new(kind, config, Arc::clone(&runner), Arc::clone(&sessions));
        (engine, runner, sessions)
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in EngineKind::ALL {
            assert_eq!(EngineKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(EngineKind::from_name("LibFuzzer"), Some(EngineKind::LibFuzzer));
        assert_eq!(EngineKind::from_name("AFL++"), Some(EngineKind::Afl));
        assert_eq!(EngineKind::from_name("honggfuzz"), None);
    }

    #[test]
    fn version_parsing() {
        assert_eq!(
            parse_version("Ubuntu clang version 17.0.6 (++20231209)").as_deref(),
            Some("17.0.6")
        );
        assert_eq!(parse_version("afl-fuzz++4.09c based on afl").as_deref(), Some("4.09c"));
        assert_eq!(parse_version("no digits here"), None);
    }

    #[tokio::test]
    async fn probing_twice_leaves_nothing_behind() {
        let work = tempdir().unwrap();
        let mut config = test_config(&work);
        config.engines.libfuzzer.probe_command =
            vec![test_target("test_target_version.sh").to_string_lossy().into_owned()];
        let (engine, runner, sessions) = engine(EngineKind::LibFuzzer, config);

        assert!(engine.is_available().await);
        assert!(engine.is_available().await);
        assert_eq!(runner.spawn_count(), 2);
        assert!(sessions.is_empty());
        assert_eq!(engine.identity().version, "1.2.3");
    }

    #[tokio::test]
    async fn missing_probe_binary_means_unavailable() {
        let work = tempdir().unwrap();
        let mut config = test_config(&work);
        config.engines.afl.probe_command = vec!["/no/such/afl-fuzz".to_string(), "-h".to_string()];
        let (engine, _runner, _sessions) = engine(EngineKind::Afl, config);

        assert!(!engine.is_available().await);
        assert_eq!(engine.identity().version, "unknown");
    }

    #[tokio::test]
    async fn crash_limit_stops_the_run_as_completed() {
        let work = tempdir().unwrap();
        let (engine, _runner, sessions) = engine(EngineKind::LibFuzzer, test_config(&work));
        let task = FuzzingTask::new(test_target("test_target_multi_crash.sh"))
            .with_timeout(Duration::from_secs(30))
            .with_max_crashes(2);

        let started = Instant::now();
        let result = engine.start_fuzzing(&task).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.status, SessionStatus::Completed);
        assert!(result.crash_count() >= 2);
        assert_eq!(result.crashes[0].crash_type, "heap-buffer-overflow");
        assert_eq!(result.crashes[1].crash_type, "use-after-free");
        assert_eq!(sessions.status(result.session_id), SessionStatus::Completed);
    }

    #[tokio::test]
    async fn non_zero_exit_without_crash_is_failed() {
        let work = tempdir().unwrap();
        let (engine, _runner, _sessions) = engine(EngineKind::LibFuzzer, test_config(&work));
        let task = FuzzingTask::new(test_target("test_target_minimize_fail.sh"))
            .with_timeout(Duration::from_secs(10));

        let result = engine.start_fuzzing(&task).await.unwrap();
        assert_eq!(result.status, SessionStatus::Failed);
        assert_eq!(result.exit_code, Some(1));
        assert!(result.crashes.is_empty());
    }

    #[tokio::test]
    async fn launch_failure_fails_the_session() {
        let work = tempdir().unwrap();
        let (engine, runner, sessions) = engine(EngineKind::LibFuzzer, test_config(&work));
        let task = FuzzingTask::new("/no/such/target").with_timeout(Duration::from_secs(1));
        let id = engine.open_session();

        let err = engine.run_session(id, &task).await.unwrap_err();
        assert!(matches!(err, EngineError::LaunchFailure { .. }), "{err:?}");
        assert_eq!(sessions.status(id), SessionStatus::Failed);
        assert_eq!(runner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn crash_artifacts_are_minimized_on_request() {
        let work = tempdir().unwrap();
        let (engine, _runner, _sessions) = engine(EngineKind::LibFuzzer, test_config(&work));
        let task = FuzzingTask::new(test_target("test_target_crash.sh"))
            .with_timeout(Duration::from_secs(10))
            .with_minimization(true);

        let result = engine.start_fuzzing(&task).await.unwrap();
        assert_eq!(result.crash_artifacts.len(), 1);
        let minimized = result.crash_artifacts[0]
            .minimized_path
            .as_ref()
            .expect("minimized artifact");
        assert_eq!(std::fs::read(minimized).unwrap(), b"MIN");
    }

    #[tokio::test]
    async fn stop_of_foreign_session_is_ignored() {
        let work = tempdir().unwrap();
        let config = test_config(&work);
        let runner = Arc::new(ProcessRunner::new());
        let sessions = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
        let libfuzzer = Engine::new(EngineKind::LibFuzzer, config.clone(), Arc::clone(&runner), Arc::clone(&sessions));
        let afl = Engine::new(EngineKind::Afl, config, runner, Arc::clone(&sessions));

        let id = libfuzzer.open_session();
        afl.stop_fuzzing(id);
        assert!(!sessions.stop_requested(id));
        assert_eq!(afl.fuzzing_status(id), SessionStatus::Unknown);
        assert_eq!(libfuzzer.fuzzing_status(id), SessionStatus::Initializing);
    }

    #[tokio::test]
    async fn pause_is_unsupported() {
        let work = tempdir().unwrap();
        let (engine, _runner, _sessions) = engine(EngineKind::Afl, test_config(&work));
        let err = engine.pause_fuzzing(SessionId::new()).unwrap_err();
        assert!(matches!(err, EngineError::UnsupportedOperation { operation: "pause", .. }));
    }

    #[tokio::test]
    async fn stop_before_launch_spawns_nothing() {
        let work = tempdir().unwrap();
        let (engine, runner, sessions) = engine(EngineKind::LibFuzzer, test_config(&work));
        let task = FuzzingTask::new(test_target("test_target_hang.sh"))
            .with_timeout(Duration::from_secs(30));
        let id = engine.open_session();
        engine.stop_fuzzing(id);

        let result = engine.run_session(id, &task).await.unwrap();
        assert_eq!(result.status, SessionStatus::Stopped);
        assert!(result.crashes.is_empty());
        assert_eq!(runner.spawn_count(), 0);
        assert_eq!(sessions.status(id), SessionStatus::Stopped);
    }

    #[tokio::test]
    async fn cleanup_before_launch_spawns_nothing() {
        let work = tempdir().unwrap();
        let (engine, runner, sessions) = engine(EngineKind::LibFuzzer, test_config(&work));
        let task = FuzzingTask::new(test_target("test_target_hang.sh"))
            .with_timeout(Duration::from_secs(30));
        let id = engine.open_session();
        assert_eq!(sessions.live_sessions(engine.name()), vec![id]);
        engine.cleanup();

        let result = engine.run_session(id, &task).await.unwrap();
        assert_eq!(result.status, SessionStatus::Stopped);
        assert_eq!(runner.spawn_count(), 0);
        assert_eq!(sessions.status(id), SessionStatus::Unknown);
    }

    #[tokio::test]
    async fn process_launched_for_stopped_session_is_killed() {
        let work = tempdir().unwrap();
        let (engine, runner, _sessions) = engine(EngineKind::LibFuzzer, test_config(&work));
        let id = engine.open_session();
        engine.stop_fuzzing(id);

        let running = engine
            .launch_attached(id, ProcessCommand::new(test_target("test_target_hang.sh")))
            .unwrap();
        let handle = running.handle.clone();
        let exit = tokio::time::timeout(Duration::from_secs(5), running.collect())
            .await
            .expect("killed process should exit")
            .unwrap()
            .exit;
        assert_eq!(exit.termination, Termination::Cancelled);
        assert!(!handle.is_alive());
        assert_eq!(runner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn session_deadline_bounds_minimization() {
        let work = tempdir().unwrap();
        let (engine, runner, sessions) = engine(EngineKind::LibFuzzer, test_config(&work));
        let task = FuzzingTask::new(test_target("test_target_slow_minimize.sh"))
            .with_timeout(Duration::from_secs(1))
            .with_minimization(true);

        let started = Instant::now();
        let result = engine.start_fuzzing(&task).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
        assert_eq!(result.status, SessionStatus::Completed);
        assert_eq!(result.crash_artifacts.len(), 1);
        assert!(result.crash_artifacts[0].minimized_path.is_none());
        assert_eq!(runner.spawn_count(), 2);
        assert!(sessions.live_sessions(engine.name()).is_empty());
    }

    #[test]
    fn walk_files_descends_into_subdirectories() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("top"), "").unwrap();
        std::fs::write(dir.path().join("a/b/deep"), "").unwrap();
        let files = walk_files(dir.path());
        assert_eq!(files, vec![dir.path().join("a/b/deep"), dir.path().join("top")]);
    }
}
