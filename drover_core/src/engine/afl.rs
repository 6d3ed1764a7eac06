use super::{EngineBackend, EngineKind, walk_files};
use crate::config::DroverConfig;
use crate::error::EngineError;
use crate::parser::SignalAccumulator;
use crate::process::{CompletedProcess, ProcessCommand};
use crate::result::{CoverageCounts, CoverageInfo};
use crate::task::FuzzingTask;
use crate::workspace::Workspace;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Placeholder AFL replaces with the path of the current input file.
pub const FILE_PLACEHOLDER: &str = "@@";

/// Size of the default AFL coverage bitmap.
const MAP_SIZE: u64 = 65_536;

const DEFAULT_SEED_NAME: &str = "default-seed";
const DEFAULT_SEED: &[u8] = b"INIT";

#[derive(Debug, Default, Clone, Copy)]
pub struct AflBackend;

/// Replaces every `@@` with `testcase`. Returns `None` when no argument
/// mentions the placeholder.
fn substitute_placeholder(args: &[String], testcase: &Path) -> Option<Vec<OsString>> {
    if !args.iter().any(|a| a.contains(FILE_PLACEHOLDER)) {
        return None;
    }
    Some(
        args.iter()
            .map(|arg| {
                let mut out = OsString::new();
                let mut parts = arg.split(FILE_PLACEHOLDER).peekable();
                while let Some(part) = parts.next() {
                    out.push(part);
                    if parts.peek().is_some() {
                        out.push(testcase.as_os_str());
                    }
                }
                out
            })
            .collect(),
    )
}

/// Runs `target` on one input: through `@@` when present, otherwise on stdin.
fn single_input(command: ProcessCommand, testcase: &Path, args: &[String]) -> ProcessCommand {
    match substitute_placeholder(args, testcase) {
        Some(args) => command.args(args),
        None => command.args(args).stdin_file(testcase),
    }
}

/// Tuple ids in an `afl-showmap` map file (`<id>:<hits>` per line).
fn map_tuples(path: &Path, tuples: &mut BTreeSet<u64>) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    tuples.extend(content.lines().filter_map(|line| {
        let (id, _hits) = line.split_once(':')?;
        id.trim().parse::<u64>().ok()
    }));
}

impl EngineBackend for AflBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Afl
    }

    fn probe_argv<'a>(&self, config: &'a DroverConfig) -> &'a [String] {
        &config.engines.afl.probe_command
    }

    /// afl-fuzz refuses to start without at least one seed.
    fn prepare_workspace(&self, workspace: &Workspace) -> Result<(), EngineError> {
        if workspace.corpus_is_empty()? {
            let seed = workspace.corpus_dir().join(DEFAULT_SEED_NAME);
            std::fs::write(&seed, DEFAULT_SEED).map_err(|e| EngineError::workspace(&seed, e))?;
            debug!(seed = %seed.display(), "Wrote default seed into empty corpus");
        }
        Ok(())
    }

    fn fuzz_command(
        &self,
        task: &FuzzingTask,
        workspace: &Workspace,
        config: &DroverConfig,
    ) -> ProcessCommand {
        let memory = match task.effective_memory_limit_mb(config) {
            0 => "none".to_string(),
            mb => mb.to_string(),
        };
        let seconds = task.effective_timeout(config).as_secs().max(1);

        let mut command = ProcessCommand::new(&config.engines.afl.afl_fuzz_path)
            .arg("-i")
            .arg(workspace.corpus_dir())
            .arg("-o")
            .arg(workspace.crashes_dir())
            .arg("-V")
            .arg(seconds.to_string())
            .arg("-m")
            .arg(memory);
        for (key, value) in &task.engine_options {
            command = command.arg(format!("-{}", key.trim_start_matches('-')));
            if !value.is_empty() {
                command = command.arg(value);
            }
        }
        command
            .arg("--")
            .arg(&task.target_path)
            .args(&task.args)
            .env("AFL_NO_UI", "1")
            .env("AFL_SKIP_CPUFREQ", "1")
    }

    fn minimize_command(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
        output: &Path,
        config: &DroverConfig,
    ) -> ProcessCommand {
        ProcessCommand::new(&config.engines.afl.afl_tmin_path)
            .arg("-i")
            .arg(testcase)
            .arg("-o")
            .arg(output)
            .arg("--")
            .arg(target)
            .args(args)
    }

    fn reproduce_command(&self, testcase: &Path, target: &Path, args: &[String]) -> ProcessCommand {
        single_input(ProcessCommand::new(target), testcase, args)
    }

    /// A directory of inputs is measured in one `afl-showmap -i` run, which
    /// writes a map per input; a single input writes one map.
    fn coverage_command(
        &self,
        testcase: &Path,
        target: &Path,
        args: &[String],
        scratch: &Path,
        config: &DroverConfig,
    ) -> ProcessCommand {
        let showmap = ProcessCommand::new(&config.engines.afl.afl_showmap_path).arg("-q");
        if testcase.is_dir() {
            showmap
                .arg("-i")
                .arg(testcase)
                .arg("-o")
                .arg(scratch.join("maps"))
                .arg("--")
                .arg(target)
                .args(args)
        } else {
            let command = showmap
                .arg("-o")
                .arg(scratch.join("map"))
                .arg("--")
                .arg(target);
            single_input(command, testcase, args)
        }
    }

    /// Map density: distinct tuples hit, over the bitmap size.
    fn interpret_coverage(&self, _completed: &CompletedProcess, scratch: &Path) -> CoverageInfo {
        let mut tuples = BTreeSet::new();
        for map in walk_files(scratch) {
            map_tuples(&map, &mut tuples);
        }
        if tuples.is_empty() {
            return CoverageInfo::unavailable();
        }
        let hit = tuples.len() as u64;
        CoverageInfo {
            available: true,
            branches: CoverageCounts::new(MAP_SIZE, hit.min(MAP_SIZE)),
            raw: Some(serde_json::json!({ "tuples": hit, "map_size": MAP_SIZE })),
            ..CoverageInfo::default()
        }
    }

    /// `id:*` files inside any `crashes` directory of the output tree; AFL++
    /// nests them per fuzzer instance (`default/crashes`).
    fn crash_artifacts(&self, workspace: &Workspace) -> Vec<PathBuf> {
        walk_files(workspace.crashes_dir())
            .into_iter()
            .filter(|path| {
                let in_crashes = path
                    .parent()
                    .and_then(Path::file_name)
                    .is_some_and(|dir| dir == "crashes");
                let is_input = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("id:"));
                in_crashes && is_input
            })
            .collect()
    }

    fn collect_final_stats(&self, workspace: &Workspace, signals: &mut SignalAccumulator) {
        for stats in walk_files(workspace.crashes_dir())
            .into_iter()
            .filter(|path| path.file_name().is_some_and(|name| name == "fuzzer_stats"))
        {
            let Ok(content) = std::fs::read_to_string(&stats) else {
                continue;
            };
            for line in content.lines() {
                signals.feed_line(EngineKind::Afl, line);
            }
        }
    }

    fn supported_platforms(&self) -> &'static [&'static str] {
        &["linux", "macos"]
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        &["stdin", "file"]
    }
}
