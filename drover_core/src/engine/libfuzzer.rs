use super::{EngineBackend, EngineKind};
use crate::config::DroverConfig;
use crate::process::{CompletedProcess, ProcessCommand};
use crate::result::{CoverageCounts, CoverageInfo};
use crate::task::FuzzingTask;
use crate::workspace::Workspace;
use once_cell::sync::Lazy;
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// File name prefixes libFuzzer uses for inputs it saves via `-artifact_prefix`.
const ARTIFACT_PREFIXES: [&str; 4] = ["crash-", "leak-", "timeout-", "oom-"];

/// `COVERED_FUNC: hits: 5 edges: 3/4 LLVMFuzzerTestOneInput /src/fuzz.c:10`
static COVERAGE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(UN)?COVERED_FUNC: hits: (\d+) edges: (\d+)/(\d+) (\S+) (.+?)(?::\d+)?$")
        .expect("valid coverage pattern")
});

#[derive(Debug, Default, Clone, Copy)]
pub struct LibFuzzerBackend;

fn flag(name: &str, value: impl AsRef<std::ffi::OsStr>) -> OsString {
    let mut flag = OsString::from(format!("-{name}="));
    flag.push(value.as_ref());
    flag
}

impl EngineBackend for LibFuzzerBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::LibFuzzer
    }

    fn probe_argv<'a>(&self, config: &'a DroverConfig) -> &'a [String] {
        &config.engines.libfuzzer.probe_command
    }

    fn fuzz_command(
        &self,
        task: &FuzzingTask,
        workspace: &Workspace,
        config: &DroverConfig,
    ) -> ProcessCommand {
        let mut prefix = workspace.crashes_dir().as_os_str().to_os_string();
        prefix.push("/");
        let max_total_time = task.effective_timeout(config).as_secs().max(1);

        let mut command = ProcessCommand::new(&task.target_path)
            .arg(flag("artifact_prefix", prefix))
            .arg(flag("max_total_time", max_total_time.to_string()))
            .arg(flag(
                "rss_limit_mb",
                task.effective_memory_limit_mb(config).to_string(),
            ))
            .arg("-print_final_stats=1");
        for (key, value) in &task.engine_options {
            command = command.arg(flag(key.trim_start_matches('-'), value));
        }
        command.args(&task.args).arg(workspace.corpus_dir())
    }

    fn minimize_command(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
        output: &Path,
        config: &DroverConfig,
    ) -> ProcessCommand {
        ProcessCommand::new(target)
            .arg("-minimize_crash=1")
            .arg(flag(
                "runs",
                config.engines.libfuzzer.minimize_runs.to_string(),
            ))
            .arg(flag("exact_artifact_path", output))
            .args(args)
            .arg(testcase)
    }

    fn reproduce_command(&self, testcase: &Path, target: &Path, args: &[String]) -> ProcessCommand {
        ProcessCommand::new(target).args(args).arg(testcase)
    }

    fn coverage_command(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
        scratch: &Path,
        _config: &DroverConfig,
    ) -> ProcessCommand {
        ProcessCommand::new(target)
            .arg("-runs=0")
            .arg("-print_coverage=1")
            .args(args)
            .arg(testcase)
            .working_dir(scratch)
    }

    /// Function-level coverage from `-print_coverage=1`. Edges count as
    /// branches; line counts are not printed by libFuzzer and stay zero.
    fn interpret_coverage(&self, completed: &CompletedProcess, _scratch: &Path) -> CoverageInfo {
        let mut info = CoverageInfo::default();
        for line in &completed.lines {
            let Some(caps) = COVERAGE_LINE.captures(line.text.trim_end()) else {
                continue;
            };
            let covered = caps.get(1).is_none();
            let edges_hit: u64 = caps[3].parse().unwrap_or(0);
            let edges_total: u64 = caps[4].parse().unwrap_or(0);
            let functions = CoverageCounts::new(1, u64::from(covered));
            let branches = CoverageCounts::new(edges_total, edges_hit.min(edges_total));

            info.functions.add(functions);
            info.branches.add(branches);
            let file = info.files.entry(caps[6].to_string()).or_default();
            file.functions.add(functions);
            file.branches.add(branches);
        }
        info.available = info.functions.total > 0;
        if !info.available {
            return CoverageInfo::unavailable();
        }
        info
    }

    fn crash_artifacts(&self, workspace: &Workspace) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(workspace.crashes_dir()) else {
            return Vec::new();
        };
        let mut artifacts: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| ARTIFACT_PREFIXES.iter().any(|p| name.starts_with(p)))
            })
            .collect();
        artifacts.sort();
        artifacts
    }

    fn supported_platforms(&self) -> &'static [&'static str] {
        &["linux", "macos", "windows"]
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        &["bytes"]
    }
}
