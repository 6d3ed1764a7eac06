//! The orchestrator: owns the engines and the session registry, resolves
//! which engine handles a request and runs every long verb on its own task.

use crate::config::DroverConfig;
use crate::engine::afl::FILE_PLACEHOLDER;
use crate::engine::{Engine, EngineIdentity, EngineKind};
use crate::error::EngineError;
use crate::process::ProcessRunner;
use crate::result::{CoverageInfo, EngineResult, ReproductionResult};
use crate::session::{SessionId, SessionRegistry, SessionStatus};
use crate::task::FuzzingTask;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Symbol every libFuzzer harness exports.
const LIBFUZZER_ENTRY_POINT: &[u8] = b"LLVMFuzzerTestOneInput";

pub struct EngineService {
    engines: Vec<Arc<Engine>>,
    sessions: Arc<SessionRegistry>,
    runner: Arc<ProcessRunner>,
}

/// A fuzzing session running in the background.
pub struct FuzzingRun {
    pub session_id: SessionId,
    pub engine: String,
    handle: JoinHandle<Result<EngineResult, EngineError>>,
    sessions: Arc<SessionRegistry>,
}

impl FuzzingRun {
    /// Waits for the session to end, logs its outcome and drops it from the
    /// registry.
    pub async fn wait(self) -> Result<EngineResult, EngineError> {
        let outcome = self
            .handle
            .await
            .map_err(|e| EngineError::WorkerFailed(e.to_string()))
            .and_then(|result| result);
        match &outcome {
            Ok(result) => info!(
                session = %self.session_id,
                engine = %self.engine,
                status = %result.status,
                executions = result.executions,
                coverage = result.coverage,
                crashes = result.crash_count(),
                artifacts = result.crash_artifacts.len(),
                "Fuzzing session finished"
            ),
            Err(e) => warn!(session = %self.session_id, engine = %self.engine, "Fuzzing session failed: {e}"),
        }
        self.sessions.forget(self.session_id);
        outcome
    }
}

/// Minimization, reproduction or coverage running in the background.
pub struct OperationHandle<T> {
    operation: &'static str,
    engine: String,
    handle: JoinHandle<Result<T, EngineError>>,
}

impl<T> OperationHandle<T> {
    pub async fn wait(self) -> Result<T, EngineError> {
        let outcome = self
            .handle
            .await
            .map_err(|e| EngineError::WorkerFailed(e.to_string()))
            .and_then(|result| result);
        match &outcome {
            Ok(_) => info!(engine = %self.engine, operation = self.operation, "Operation finished"),
            Err(e) => warn!(engine = %self.engine, operation = self.operation, "Operation failed: {e}"),
        }
        outcome
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

fn dispatch<T, F>(engine: &'static str, operation: &'static str, work: F) -> OperationHandle<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T, EngineError>> + Send + 'static,
{
    info!(engine, operation, "Dispatching operation");
    OperationHandle {
        operation,
        engine: engine.to_string(),
        handle: tokio::spawn(work),
    }
}

impl EngineService {
    /// Probes every engine family and keeps the usable ones.
    pub async fn start(config: DroverConfig) -> Result<Self, EngineError> {
        Self::start_with_runner(config, Arc::new(ProcessRunner::new())).await
    }

    pub async fn start_with_runner(
        config: DroverConfig,
        runner: Arc<ProcessRunner>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let sessions = Arc::new(SessionRegistry::new(config.session_retention()));
        let mut engines = Vec::new();
        for kind in EngineKind::ALL {
            let engine = Engine::new(kind, config.clone(), Arc::clone(&runner), Arc::clone(&sessions));
            if engine.is_available().await {
                let identity = engine.identity();
                info!(engine = %identity.name, version = %identity.version, "Engine available");
                engines.push(Arc::new(engine));
            } else {
                warn!(engine = kind.name(), "Engine unavailable, excluding it");
            }
        }
        if engines.is_empty() {
            return Err(EngineError::NoEngineAvailable);
        }
        Ok(Self {
            engines,
            sessions,
            runner,
        })
    }

    /// Registers the given families without probing them.
    pub fn with_engines(
        config: DroverConfig,
        runner: Arc<ProcessRunner>,
        kinds: &[EngineKind],
    ) -> Result<Self, EngineError> {
        config.validate()?;
        if kinds.is_empty() {
            return Err(EngineError::NoEngineAvailable);
        }
        let sessions = Arc::new(SessionRegistry::new(config.session_retention()));
        let engines = kinds
            .iter()
            .map(|&kind| {
                Arc::new(Engine::new(
                    kind,
                    config.clone(),
                    Arc::clone(&runner),
                    Arc::clone(&sessions),
                ))
            })
            .collect();
        Ok(Self {
            engines,
            sessions,
            runner,
        })
    }

    /// Hot-swaps the configuration of every engine. Running sessions are not
    /// affected.
    pub fn reconfigure(&self, config: DroverConfig) -> Result<(), EngineError> {
        config.validate()?;
        for engine in &self.engines {
            engine.initialize(config.clone());
        }
        Ok(())
    }

    pub fn available_engines(&self) -> Vec<EngineIdentity> {
        self.engines.iter().map(|e| e.identity()).collect()
    }

    pub fn runner(&self) -> &Arc<ProcessRunner> {
        &self.runner
    }

    pub fn engine(&self, name: &str) -> Result<Arc<Engine>, EngineError> {
        EngineKind::from_name(name)
            .and_then(|kind| self.engines.iter().find(|e| e.kind() == kind))
            .cloned()
            .ok_or_else(|| EngineError::EngineNotFound(name.to_string()))
    }

    /// The task's engine when named, otherwise the most preferred available one.
    pub fn select_engine(&self, task: &FuzzingTask) -> Result<Arc<Engine>, EngineError> {
        if task.has_explicit_engine() {
            return self.engine(&task.engine);
        }
        EngineKind::ALL
            .iter()
            .find_map(|&kind| self.engines.iter().find(|e| e.kind() == kind))
            .or_else(|| self.engines.first())
            .cloned()
            .ok_or(EngineError::NoEngineAvailable)
    }

    /// Opens a session and starts fuzzing in the background. Engine selection
    /// errors are returned before anything is spawned.
    pub fn start_fuzzing(&self, task: FuzzingTask) -> Result<FuzzingRun, EngineError> {
        let engine = self.select_engine(&task)?;
        let session_id = engine.open_session();
        info!(
            session = %session_id,
            engine = engine.name(),
            target = %task.target_path.display(),
            "Starting fuzzing session"
        );
        let worker = Arc::clone(&engine);
        let handle = tokio::spawn(async move { worker.run_session(session_id, &task).await });
        Ok(FuzzingRun {
            session_id,
            engine: engine.name().to_string(),
            handle,
            sessions: Arc::clone(&self.sessions),
        })
    }

    pub fn stop_fuzzing(&self, engine: &str, session_id: SessionId) -> Result<(), EngineError> {
        self.engine(engine)?.stop_fuzzing(session_id);
        Ok(())
    }

    pub fn fuzzing_status(
        &self,
        engine: &str,
        session_id: SessionId,
    ) -> Result<SessionStatus, EngineError> {
        Ok(self.engine(engine)?.fuzzing_status(session_id))
    }

    pub fn pause_fuzzing(&self, engine: &str, session_id: SessionId) -> Result<(), EngineError> {
        self.engine(engine)?.pause_fuzzing(session_id)
    }

    pub fn minimize_test_case(
        &self,
        engine: &str,
        testcase: PathBuf,
        target: PathBuf,
        args: Vec<String>,
    ) -> Result<OperationHandle<PathBuf>, EngineError> {
        let engine = self.engine(engine)?;
        Ok(dispatch(engine.name(), "minimize", async move {
            engine.minimize_test_case(&testcase, &target, &args).await
        }))
    }

    pub fn reproduce_crash(
        &self,
        engine: &str,
        testcase: PathBuf,
        target: PathBuf,
        args: Vec<String>,
    ) -> Result<OperationHandle<ReproductionResult>, EngineError> {
        let engine = self.engine(engine)?;
        Ok(dispatch(engine.name(), "reproduce", async move {
            engine.reproduce_crash(&testcase, &target, &args).await
        }))
    }

    pub fn generate_coverage(
        &self,
        engine: &str,
        testcase: PathBuf,
        target: PathBuf,
        args: Vec<String>,
    ) -> Result<OperationHandle<CoverageInfo>, EngineError> {
        let engine = self.engine(engine)?;
        Ok(dispatch(engine.name(), "coverage", async move {
            Ok(engine.generate_coverage(&testcase, &target, &args).await)
        }))
    }

    /// Engines suited to `target` invoked with `args`, best first.
    ///
    /// `@@` in the arguments means the target reads its input from a file,
    /// which only file-based engines provide. A readable binary lacking the
    /// libFuzzer entry point cannot be driven in-process.
    pub fn engine_recommendations(&self, target: &Path, args: &[String]) -> Vec<EngineKind> {
        let needs_file = args.iter().any(|a| a.contains(FILE_PLACEHOLDER));
        let lacks_entry_point = std::fs::read(target).is_ok_and(|bytes| {
            !bytes
                .windows(LIBFUZZER_ENTRY_POINT.len())
                .any(|w| w == LIBFUZZER_ENTRY_POINT)
        });
        EngineKind::ALL
            .iter()
            .filter_map(|&kind| self.engines.iter().find(|e| e.kind() == kind))
            .filter(|engine| !needs_file || engine.supported_formats().contains(&"file"))
            .filter(|engine| !(lacks_entry_point && engine.kind().is_in_process()))
            .map(|engine| engine.kind())
            .collect()
    }

    /// Kills every live session. Called once when the host shuts down.
    pub fn shutdown(&self) {
        for engine in &self.engines {
            engine.cleanup();
        }
        info!(remaining = self.sessions.len(), "Engine service shut down");
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

    fn service(work: &TempDir, kinds: &[EngineKind]) -> (EngineService, Arc<ProcessRunner>) {
        let runner = Arc::new(ProcessRunner::with_drain_grace(Duration::from_millis(200)));
        let service = EngineService::with_engines(test_config(work), Arc::clone(&runner), kinds).unwrap();
        (service, runner)
    }

    async fn wait_until_running(service: &EngineService, engine: &str, id: SessionId) {
        for _ in 0..200 {
            if service.fuzzing_status(engine, id).unwrap() == SessionStatus::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {id} never reached Running");
    }

    #[tokio::test]
    async fn normal_completion_reports_counters() {
        let work = tempdir().unwrap();
        let (service, _runner) = service(&work, &[EngineKind::LibFuzzer]);
        let task = FuzzingTask::new(test_target("test_target_ok.sh")).with_timeout(Duration::from_secs(10));

        let result = service.start_fuzzing(task).unwrap().wait().await.unwrap();
        assert_eq!(result.status, SessionStatus::Completed);
        assert_eq!(result.coverage, 120);
        assert_eq!(result.executions, 50);
        assert_eq!(result.crash_count(), 0);
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.engine, "libfuzzer");
    }

    #[tokio::test]
    async fn crash_is_detected_and_artifact_collected() {
        let work = tempdir().unwrap();
        let (service, _runner) = service(&work, &[EngineKind::LibFuzzer]);
        let task = FuzzingTask::new(test_target("test_target_crash.sh"))
            .with_engine("libfuzzer")
            .with_timeout(Duration::from_secs(10));

        let result = service.start_fuzzing(task).unwrap().wait().await.unwrap();
        assert_eq!(result.crash_count(), 1);
        assert_eq!(result.crashes[0].crash_type, "heap-buffer-overflow");
        assert_eq!(result.crashes[0].location, "READ");
        assert_eq!(result.exit_code, Some(1));
        assert_eq!(result.status, SessionStatus::Completed);
        assert_eq!(result.crash_artifacts.len(), 1);
        let artifact = &result.crash_artifacts[0];
        assert!(artifact.path.file_name().unwrap().to_string_lossy().starts_with("crash-"));
        assert_eq!(artifact.md5, format!("{:x}", md5::compute(b"BOOM")));
    }

    #[tokio::test]
    async fn hanging_engine_times_out_within_bounds() {
        let work = tempdir().unwrap();
        let (service, _runner) = service(&work, &[EngineKind::LibFuzzer]);
        let task = FuzzingTask::new(test_target("test_target_hang.sh")).with_timeout(Duration::from_secs(1));

        let started = Instant::now();
        let run = service.start_fuzzing(task).unwrap();
        let id = run.session_id;
        let result = tokio::time::timeout(Duration::from_secs(10), run.wait())
            .await
            .expect("timed out session must resolve")
            .unwrap();

        assert_eq!(result.status, SessionStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5), "{:?}", started.elapsed());
        assert_eq!(result.exit_code, None);
        #[cfg(unix)]
        assert_eq!(result.signal, Some(9));
        assert_eq!(service.fuzzing_status("libfuzzer", id).unwrap(), SessionStatus::Unknown);
    }

    #[tokio::test]
    async fn stop_ends_only_the_requested_session() {
        let work = tempdir().unwrap();
        let (service, _runner) = service(&work, &[EngineKind::LibFuzzer]);
        let hang = || FuzzingTask::new(test_target("test_target_hang.sh")).with_timeout(Duration::from_secs(30));

        let first = service.start_fuzzing(hang()).unwrap();
        let second = service.start_fuzzing(hang()).unwrap();
        wait_until_running(&service, "libfuzzer", first.session_id).await;
        wait_until_running(&service, "libfuzzer", second.session_id).await;

        service.stop_fuzzing("libfuzzer", SessionId::new()).unwrap();
        service.stop_fuzzing("libfuzzer", first.session_id).unwrap();
        let stopped = first.wait().await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);
        service.stop_fuzzing("libfuzzer", stopped.session_id).unwrap();

        assert_eq!(
            service.fuzzing_status("libfuzzer", second.session_id).unwrap(),
            SessionStatus::Running
        );
        service.stop_fuzzing("libfuzzer", second.session_id).unwrap();
        assert_eq!(second.wait().await.unwrap().status, SessionStatus::Stopped);
    }

    async fn wait_for_spawns(runner: &ProcessRunner, count: usize) {
        for _ in 0..500 {
            if runner.spawn_count() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("only {} of {count} processes spawned", runner.spawn_count());
    }

    fn slow_minimizing_task() -> FuzzingTask {
        FuzzingTask::new(test_target("test_target_slow_minimize.sh"))
            .with_timeout(Duration::from_secs(30))
            .with_minimization(true)
    }

    #[tokio::test]
    async fn stop_during_minimization_ends_the_session() {
        let work = tempdir().unwrap();
        let (service, runner) = service(&work, &[EngineKind::LibFuzzer]);

        let started = Instant::now();
        let run = service.start_fuzzing(slow_minimizing_task()).unwrap();
        let id = run.session_id;
        // The fuzz run exits at once; the second process is the minimizer.
        wait_for_spawns(&runner, 2).await;
        assert_eq!(service.fuzzing_status("libfuzzer", id).unwrap(), SessionStatus::Running);

        service.stop_fuzzing("libfuzzer", id).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), run.wait())
            .await
            .expect("stopped session must resolve")
            .unwrap();
        assert_eq!(result.status, SessionStatus::Stopped);
        assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
        assert_eq!(result.crash_count(), 1);
        assert_eq!(result.crash_artifacts.len(), 1);
        assert!(result.crash_artifacts[0].minimized_path.is_none());
        assert_eq!(runner.spawn_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_during_minimization_ends_the_session() {
        let work = tempdir().unwrap();
        let (service, runner) = service(&work, &[EngineKind::LibFuzzer]);

        let run = service.start_fuzzing(slow_minimizing_task()).unwrap();
        wait_for_spawns(&runner, 2).await;

        service.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(10), run.wait())
            .await
            .expect("shutdown must end the session")
            .unwrap();
        assert_eq!(result.status, SessionStatus::Stopped);
        assert!(result.crash_artifacts[0].minimized_path.is_none());
        assert!(service.sessions.is_empty());
    }

    #[tokio::test]
    async fn unknown_engine_fails_before_spawning() {
        let work = tempdir().unwrap();
        let (service, runner) = service(&work, &[EngineKind::LibFuzzer, EngineKind::Afl]);
        let task = FuzzingTask::new(test_target("test_target_ok.sh")).with_engine("nonexistent");

        let err = service.start_fuzzing(task).err().expect("must fail");
        assert!(matches!(&err, EngineError::EngineNotFound(name) if name == "nonexistent"));
        let err = service
            .minimize_test_case(
                "nonexistent",
                PathBuf::from("/tmp/crash"),
                test_target("test_target_ok.sh"),
                Vec::new(),
            )
            .err()
            .expect("must fail");
        assert!(matches!(err, EngineError::EngineNotFound(_)));
        assert!(matches!(
            service.fuzzing_status("nonexistent", SessionId::new()),
            Err(EngineError::EngineNotFound(_))
        ));
        assert_eq!(runner.spawn_count(), 0);
    }

    #[tokio::test]
    async fn minimization_without_artifact_fails() {
        let work = tempdir().unwrap();
        let (service, _runner) = service(&work, &[EngineKind::LibFuzzer]);
        let testcase = work.path().join("crash-input");
        std::fs::write(&testcase, b"AAAA").unwrap();

        let err = service
            .minimize_test_case("libfuzzer", testcase, test_target("test_target_minimize_fail.sh"), Vec::new())
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MinimizationFailed(_)), "{err:?}");
    }

    #[tokio::test]
    async fn minimization_returns_the_artifact() {
        let work = tempdir().unwrap();
        let (service, _runner) = service(&work, &[EngineKind::LibFuzzer]);
        let testcase = work.path().join("crash-input");
        std::fs::write(&testcase, b"AAAA").unwrap();

        let minimized = service
            .minimize_test_case("libfuzzer", testcase, test_target("test_target_crash.sh"), Vec::new())
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(minimized.starts_with(work.path().join("work").join("minimized")));
        assert_eq!(std::fs::read(minimized).unwrap(), b"MIN");
    }

    #[tokio::test]
    async fn reproduction_extracts_crash_type() {
        let work = tempdir().unwrap();
        let (service, _runner) = service(&work, &[EngineKind::LibFuzzer]);
        let testcase = work.path().join("crash-input");
        std::fs::write(&testcase, b"AAAA").unwrap();

        let reproduced = service
            .reproduce_crash("libfuzzer", testcase.clone(), test_target("test_target_crash.sh"), Vec::new())
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(reproduced.reproduced);
        assert_eq!(reproduced.exit_code, Some(1));
        assert_eq!(reproduced.crash_type.as_deref(), Some("heap-buffer-overflow"));
        assert!(reproduced.output.contains("SUMMARY: AddressSanitizer"));

        let clean = service
            .reproduce_crash("libfuzzer", testcase, test_target("test_target_ok.sh"), Vec::new())
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(!clean.reproduced);
        assert_eq!(clean.crash_type, None);
    }

    #[tokio::test]
    async fn reproduction_launch_failure_is_typed() {
        let work = tempdir().unwrap();
        let (service, _runner) = service(&work, &[EngineKind::LibFuzzer]);
        let err = service
            .reproduce_crash(
                "libfuzzer",
                work.path().join("input"),
                PathBuf::from("/no/such/target"),
                Vec::new(),
            )
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ReproductionFailed(_)), "{err:?}");
    }

    #[tokio::test]
    async fn coverage_degrades_to_unavailable() {
        let work = tempdir().unwrap();
        let (service, _runner) = service(&work, &[EngineKind::LibFuzzer]);
        let testcase = work.path().join("input");
        std::fs::write(&testcase, b"x").unwrap();

        let measured = service
            .generate_coverage("libfuzzer", testcase.clone(), test_target("test_target_coverage.sh"), Vec::new())
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(measured.available);
        assert_eq!(measured.functions.total, 2);
        assert_eq!(measured.functions.covered, 1);

        let plain = service
            .generate_coverage("libfuzzer", testcase.clone(), test_target("test_target_ok.sh"), Vec::new())
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(plain, CoverageInfo::unavailable());

        let missing = service
            .generate_coverage("libfuzzer", testcase, PathBuf::from("/no/such/target"), Vec::new())
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(!missing.available);
    }

    #[tokio::test]
    async fn run_with_coverage_attaches_report() {
        let work = tempdir().unwrap();
        let (service, _runner) = service(&work, &[EngineKind::LibFuzzer]);
        let task = FuzzingTask::new(test_target("test_target_coverage.sh"))
            .with_timeout(Duration::from_secs(10))
            .with_coverage(true);

        let result = service.start_fuzzing(task).unwrap().wait().await.unwrap();
        let report = result.coverage_report.expect("coverage report");
        assert!(report.available);
        assert_eq!(report.branches.covered, 3);
    }

    #[tokio::test]
    async fn seeds_are_copied_before_launch() {
        let work = tempdir().unwrap();
        let (service, _runner) = service(&work, &[EngineKind::LibFuzzer]);
        let seeds = tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(seeds.path().join(format!("seed{i}")), [i as u8]).unwrap();
        }
        let task = FuzzingTask::new(test_target("test_target_count_corpus.sh"))
            .with_corpus(seeds.path())
            .with_timeout(Duration::from_secs(10));

        let result = service.start_fuzzing(task).unwrap().wait().await.unwrap();
        // The stub reports the corpus size as its execution count.
        assert_eq!(result.executions, 5);
        assert_eq!(std::fs::read_dir(seeds.path()).unwrap().count(), 5);
    }

    #[tokio::test]
    async fn afl_run_reads_stats_and_crashes() {
        let work = tempdir().unwrap();
        let mut config = test_config(&work);
        config.engines.afl.afl_fuzz_path = test_target("test_target_afl_fuzz.sh");
        let runner = Arc::new(ProcessRunner::new());
        let service = EngineService::with_engines(config, runner, &[EngineKind::Afl]).unwrap();
        let task = FuzzingTask::new("/out/readelf")
            .with_args(["-a", "@@"])
            .with_timeout(Duration::from_secs(10));

        let result = service.start_fuzzing(task).unwrap().wait().await.unwrap();
        assert_eq!(result.engine, "afl");
        assert_eq!(result.status, SessionStatus::Completed);
        assert_eq!(result.executions, 4242);
        assert_eq!(result.coverage, 17);
        assert_eq!(result.crash_artifacts.len(), 1);
        assert!(
            result.crash_artifacts[0]
                .path
                .to_string_lossy()
                .ends_with("default/crashes/id:000000,sig:11,src:000000")
        );
    }

    #[tokio::test]
    async fn default_selection_prefers_in_process_engine() {
        let work = tempdir().unwrap();
        let (both, _) = service(&work, &[EngineKind::Afl, EngineKind::LibFuzzer]);
        let task = FuzzingTask::new("/bin/target");
        assert_eq!(both.select_engine(&task).unwrap().kind(), EngineKind::LibFuzzer);

        let (afl_only, _) = service(&work, &[EngineKind::Afl]);
        assert_eq!(afl_only.select_engine(&task).unwrap().kind(), EngineKind::Afl);
        assert!(matches!(
            afl_only.select_engine(&task.clone().with_engine("libfuzzer")),
            Err(EngineError::EngineNotFound(_))
        ));
    }

    #[tokio::test]
    async fn recommendations_follow_target_shape() {
        let work = tempdir().unwrap();
        let (service, _) = service(&work, &[EngineKind::LibFuzzer, EngineKind::Afl]);
        let harness = work.path().join("harness");
        std::fs::write(&harness, b"\x7fELF....LLVMFuzzerTestOneInput....").unwrap();
        let plain = work.path().join("plain");
        std::fs::write(&plain, b"\x7fELF....main....").unwrap();

        assert_eq!(
            service.engine_recommendations(&harness, &[]),
            vec![EngineKind::LibFuzzer, EngineKind::Afl]
        );
        assert_eq!(
            service.engine_recommendations(&harness, &["@@".to_string()]),
            vec![EngineKind::Afl]
        );
        assert_eq!(service.engine_recommendations(&plain, &[]), vec![EngineKind::Afl]);
    }

    #[tokio::test]
    async fn startup_without_usable_engines_fails() {
        let work = tempdir().unwrap();
        let mut config = test_config(&work);
        config.engines.libfuzzer.probe_command = vec!["/no/such/clang".to_string()];
        config.engines.afl.probe_command = vec!["/no/such/afl-fuzz".to_string()];
        let err = EngineService::start(config).await.err().expect("must fail");
        assert!(matches!(err, EngineError::NoEngineAvailable));
    }

    #[tokio::test]
    async fn startup_excludes_unavailable_engines() {
        let work = tempdir().unwrap();
        let mut config = test_config(&work);
        config.engines.libfuzzer.probe_command =
            vec![test_target("test_target_version.sh").to_string_lossy().into_owned()];
        config.engines.afl.probe_command = vec!["/no/such/afl-fuzz".to_string()];

        let service = EngineService::start(config).await.unwrap();
        let engines = service.available_engines();
        assert_eq!(engines.len(), 1);
        assert_eq!(engines[0].name, "libfuzzer");
        assert_eq!(engines[0].version, "1.2.3");
        assert!(matches!(
            service.fuzzing_status("afl", SessionId::new()),
            Err(EngineError::EngineNotFound(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_kills_running_sessions() {
        let work = tempdir().unwrap();
        let (service, _runner) = service(&work, &[EngineKind::LibFuzzer]);
        let run = service
            .start_fuzzing(FuzzingTask::new(test_target("test_target_hang.sh")).with_timeout(Duration::from_secs(30)))
            .unwrap();
        wait_until_running(&service, "libfuzzer", run.session_id).await;

        service.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(10), run.wait())
            .await
            .expect("shutdown must end the session")
            .unwrap();
        assert_eq!(result.status, SessionStatus::Stopped);
        assert!(service.sessions.is_empty());
    }

    #[tokio::test]
    async fn pause_is_rejected() {
        let work = tempdir().unwrap();
        let (service, _) = service(&work, &[EngineKind::LibFuzzer]);
        assert!(matches!(
            service.pause_fuzzing("libfuzzer", SessionId::new()),
            Err(EngineError::UnsupportedOperation { .. })
        ));
    }
}
