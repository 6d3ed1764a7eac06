//! Child process supervision.
//!
//! Every process runs in its own process group. A supervisor task owns the
//! child and resolves its exit exactly once: on natural exit, on deadline
//! expiry, or on cancellation through a [`ProcessHandle`]. The last two kill the
//! whole group with SIGKILL, so grandchildren holding the output pipes die too.

use crate::error::EngineError;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const LINE_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// An executable invocation with everything needed to spawn it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    program: PathBuf,
    args: Vec<OsString>,
    working_dir: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
    stdin: Option<PathBuf>,
    deadline: Option<Duration>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            stdin: None,
            deadline: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds a variable on top of the inherited environment.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Feeds the file's contents to the child's stdin. Stdin is null otherwise.
    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    /// Hard wall-clock limit, measured from spawn.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Arguments as strings, for logging and assertions.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub fn get_env(&self, key: &str) -> Option<&OsStr> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    pub fn get_working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn get_stdin(&self) -> Option<&Path> {
        self.stdin.as_deref()
    }

    pub fn get_deadline(&self) -> Option<Duration> {
        self.deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub termination: Termination,
    pub exit_code: Option<i32>,
    /// Signal that terminated the process, when it did not exit on its own.
    pub signal: Option<i32>,
    pub elapsed: Duration,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }
}

struct HandleState {
    pid: Option<u32>,
    cancel: watch::Sender<bool>,
    alive: AtomicBool,
}

/// Cheap cloneable control over one running process.
#[derive(Clone)]
pub struct ProcessHandle {
    state: Arc<HandleState>,
}

impl ProcessHandle {
    /// Requests a forceful kill. Calling it again, or after the process is
    /// gone, does nothing.
    pub fn cancel(&self) {
        if self.is_alive() {
            self.state.cancel.send_replace(true);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.state.alive.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.pid
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.state.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Output of the process in emission order per stream. Ends once both streams
/// are closed.
pub struct OutputLines {
    rx: mpsc::Receiver<OutputLine>,
}

impl OutputLines {
    pub async fn next_line(&mut self) -> Option<OutputLine> {
        self.rx.recv().await
    }
}

pub struct ExitWaiter {
    rx: oneshot::Receiver<ProcessExit>,
}

impl ExitWaiter {
    pub async fn wait(self) -> Result<ProcessExit, EngineError> {
        self.rx
            .await
            .map_err(|_| EngineError::WorkerFailed("process supervisor vanished".to_string()))
    }
}

pub struct RunningProcess {
    pub handle: ProcessHandle,
    pub lines: OutputLines,
    pub exit: ExitWaiter,
}

impl RunningProcess {
    /// Reads every line the process prints, then waits for its exit.
    pub async fn collect(self) -> Result<CompletedProcess, EngineError> {
        let RunningProcess {
            handle: _handle,
            mut lines,
            exit,
        } = self;
        let mut collected = Vec::new();
        while let Some(line) = lines.next_line().await {
            collected.push(line);
        }
        let exit = exit.wait().await?;
        Ok(CompletedProcess {
            exit,
            lines: collected,
        })
    }
}

/// A process that ran to its end, with everything it printed.
#[derive(Debug, Clone)]
pub struct CompletedProcess {
    pub exit: ProcessExit,
    pub lines: Vec<OutputLine>,
}

impl CompletedProcess {
    pub fn combined_output(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.text);
            out.push('\n');
        }
        out
    }
}

pub struct ProcessRunner {
    spawn_attempts: AtomicUsize,
    drain_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::with_drain_grace(DEFAULT_DRAIN_GRACE)
    }

    /// `drain_grace` bounds how long output readers may keep running once the
    /// process is gone.
    pub fn with_drain_grace(drain_grace: Duration) -> Self {
        Self {
            spawn_attempts: AtomicUsize::new(0),
            drain_grace,
        }
    }

    /// Number of spawn attempts made through this runner.
    pub fn spawn_count(&self) -> usize {
        self.spawn_attempts.load(Ordering::SeqCst)
    }

    /// Spawns the command under supervision. Must be called inside a tokio
    /// runtime.
    pub fn spawn(&self, command: ProcessCommand) -> Result<RunningProcess, EngineError> {
        self.spawn_attempts.fetch_add(1, Ordering::SeqCst);
        let launch_failure = |source| EngineError::LaunchFailure {
            program: command.program.clone(),
            source,
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match &command.stdin {
            Some(path) => {
                let file = std::fs::File::open(path).map_err(launch_failure)?;
                cmd.stdin(Stdio::from(file));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(launch_failure)?;
        let pid = child.id();
        debug!(
            program = %command.program.display(),
            pid = ?pid,
            args = ?command.args_lossy(),
            "Spawned process"
        );

        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump_lines(
                stdout,
                OutputStream::Stdout,
                line_tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump_lines(
                stderr,
                OutputStream::Stderr,
                line_tx.clone(),
            )));
        }
        drop(line_tx);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let state = Arc::new(HandleState {
            pid,
            cancel: cancel_tx,
            alive: AtomicBool::new(true),
        });
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(supervise(
            child,
            Arc::clone(&state),
            cancel_rx,
            command.deadline,
            readers,
            self.drain_grace,
            exit_tx,
        ));

        Ok(RunningProcess {
            handle: ProcessHandle { state },
            lines: OutputLines { rx: line_rx },
            exit: ExitWaiter { rx: exit_rx },
        })
    }

    /// Runs the command and collects every line it prints.
    pub async fn run_to_completion(
        &self,
        command: ProcessCommand,
    ) -> Result<CompletedProcess, EngineError> {
        self.spawn(command)?.collect().await
    }
}

async fn pump_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut forwarding = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if !forwarding {
                    // Keep draining so the child never blocks on a full pipe.
                    continue;
                }
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    forwarding = false;
                }
            }
            Err(e) => {
                debug!(?stream, "Output reader stopped: {e}");
                break;
            }
        }
    }
}

async fn cancel_requested(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        // Every handle is gone; nobody can cancel any more.
        std::future::pending::<()>().await;
    }
}

async fn sleep_for(deadline: Option<Duration>) {
    match deadline {
        Some(deadline) => tokio::time::sleep(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn supervise(
    mut child: Child,
    state: Arc<HandleState>,
    cancel_rx: watch::Receiver<bool>,
    deadline: Option<Duration>,
    mut readers: Vec<JoinHandle<()>>,
    drain_grace: Duration,
    exit_tx: oneshot::Sender<ProcessExit>,
) {
    let started = Instant::now();

    let (termination, status) = tokio::select! {
        status = child.wait() => (Termination::Exited, status),
        _ = sleep_for(deadline) => {
            debug!(pid = ?state.pid, "Deadline reached, killing process group");
            (Termination::TimedOut, terminate(&mut child, state.pid).await)
        }
        _ = cancel_requested(cancel_rx) => {
            debug!(pid = ?state.pid, "Cancellation requested, killing process group");
            (Termination::Cancelled, terminate(&mut child, state.pid).await)
        }
    };
    state.alive.store(false, Ordering::SeqCst);
    let elapsed = started.elapsed();

    let drained = tokio::time::timeout(drain_grace, async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    })
    .await
    .is_ok();
    if !drained {
        // Something outside the killed group still holds the pipes open.
        trace!(pid = ?state.pid, "Output readers did not drain in time");
        if let Some(pid) = state.pid {
            kill_process_group(pid);
        }
        for reader in &readers {
            reader.abort();
        }
    }

    let (exit_code, signal) = match status {
        Ok(status) => (status.code(), exit_signal(&status)),
        Err(e) => {
            warn!(pid = ?state.pid, "Failed to reap process: {e}");
            (None, None)
        }
    };
    let _ = exit_tx.send(ProcessExit {
        termination,
        exit_code,
        signal,
        elapsed,
    });
}

async fn terminate(child: &mut Child, pid: Option<u32>) -> std::io::Result<std::process::ExitStatus> {
    if let Some(pid) = pid {
        kill_process_group(pid);
    }
    if let Err(e) = child.start_kill() {
        trace!("start_kill after group kill: {e}");
    }
    child.wait().await
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, "Failed to kill process group: {e}"),
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}
