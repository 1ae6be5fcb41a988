//! External process runner.
//!
//! Launches one tool executable, captures its console output and drives a
//! fixed-interval tick callback while the process runs.
//! Key responsibilities:
//! - Resolve the executable before spawning anything
//! - Move long argument strings into an argument file (`/R:<file>` or an
//!   integration-specific switch)
//! - Stream stdout to the console log as it arrives, or buffer it in memory
//!   and flush at exit
//! - Enforce the optional wall-clock timeout and honour cancellation

use harness_core::{CaptureMode, Config, RunRequest};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between "still running" log lines, independent of the poll interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for collecting stdout/stderr after the process exits or is killed.
///
/// A grandchild that inherited the pipes can keep them open after the tool
/// itself is gone.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes buffered in memory per stream.
const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

/// Historical command-line limit of the tools this harness drives.
pub const DEFAULT_MAX_INLINE_ARGS_LEN: usize = 250;

/// Switch that tells a tool to read its arguments from a file.
pub const DEFAULT_ARGS_FILE_SWITCH: &str = "/R:";

const STDERR_SEPARATOR: &[u8] = b"\n\n--- STDERR ---\n";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("executable not found: {0}")]
    ExecutableNotFound(PathBuf),
    #[error("working directory does not exist: {0}")]
    WorkingDirMissing(PathBuf),
    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write argument file {path}: {source}")]
    ArgumentAssembly {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Joined argument strings longer than this go to an argument file.
    pub max_inline_args_len: usize,
    pub args_file_switch: String,
    pub capture_mode: CaptureMode,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_inline_args_len: DEFAULT_MAX_INLINE_ARGS_LEN,
            args_file_switch: DEFAULT_ARGS_FILE_SWITCH.to_string(),
            capture_mode: CaptureMode::File,
        }
    }
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_inline_args_len: config.max_inline_args_len,
            capture_mode: config.capture_mode,
            ..Self::default()
        }
    }

    pub fn with_args_file_switch(mut self, switch: impl Into<String>) -> Self {
        self.args_file_switch = switch.into();
        self
    }
}

/// How the arguments reach the child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Inline(Vec<String>),
    /// Arguments were written to `path`; the child gets the single `switch_arg`.
    ArgsFile { path: PathBuf, switch_arg: String },
}

impl Invocation {
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Inline(args) => args.clone(),
            Self::ArgsFile { switch_arg, .. } => vec![switch_arg.clone()],
        }
    }

    pub fn is_externalized(&self) -> bool {
        matches!(self, Self::ArgsFile { .. })
    }
}

/// Join arguments into one command string, quoting any that contain whitespace.
pub fn join_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.is_empty() || arg.chars().any(char::is_whitespace) {
                format!("\"{arg}\"")
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decide between inline arguments and an argument file.
pub fn assemble_invocation(
    args: &[String],
    working_dir: &Path,
    max_inline_len: usize,
    switch: &str,
) -> Result<Invocation> {
    let joined = join_args(args);
    if joined.len() <= max_inline_len {
        return Ok(Invocation::Inline(args.to_vec()));
    }

    let path = working_dir.join(format!("harness_args_{}.txt", uuid::Uuid::now_v7()));
    std::fs::write(&path, &joined).map_err(|source| RunnerError::ArgumentAssembly {
        path: path.clone(),
        source,
    })?;
    debug!(
        args_len = joined.len(),
        limit = max_inline_len,
        path = %path.display(),
        "arguments externalized"
    );
    Ok(Invocation::ArgsFile {
        switch_arg: format!("{switch}{}", path.display()),
        path,
    })
}

fn remove_args_file(invocation: &Invocation) {
    if let Invocation::ArgsFile { path, .. } = invocation {
        if let Err(err) = std::fs::remove_file(path) {
            debug!(path = %path.display(), error = %err, "could not remove argument file");
        }
    }
}

/// Resolve an executable: paths must point at a file, bare names are looked up on `PATH`.
///
/// Relative paths are made absolute, since the child runs in its working directory.
pub fn resolve_executable(executable: &Path) -> Result<PathBuf> {
    if executable.components().count() > 1 || executable.is_absolute() {
        return if executable.is_file() {
            Ok(std::path::absolute(executable)?)
        } else {
            Err(RunnerError::ExecutableNotFound(executable.to_path_buf()))
        };
    }

    std::env::var_os("PATH")
        .iter()
        .flat_map(std::env::split_paths)
        .map(|dir| dir.join(executable))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| RunnerError::ExecutableNotFound(executable.to_path_buf()))
}

/// Read from an async reader with a maximum byte limit.
async fn read_bounded<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8192);
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(buf.len());
        if remaining == 0 {
            warn!(max_bytes, "output exceeded limit, truncating");
            // Keep draining so the child never blocks on a full pipe.
            while reader.read(&mut chunk).await? > 0 {}
            break;
        }

        let to_take = n.min(remaining);
        buf.extend_from_slice(&chunk[..to_take]);
    }

    Ok(buf)
}

/// Append raw output to the console log as it arrives.
async fn stream_to_file<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    path: PathBuf,
) -> io::Result<u64> {
    let mut file = tokio::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)
        .await?;
    let mut chunk = [0u8; 8192];
    let mut written = 0u64;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        file.write_all(&chunk[..n]).await?;
        file.flush().await?;
        written += n as u64;
    }

    file.flush().await?;
    Ok(written)
}

enum Captured {
    Streamed(u64),
    Buffered(Vec<u8>),
}

/// A running tool.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    invocation: Invocation,
    console_log: PathBuf,
    capture_mode: CaptureMode,
    poll_interval: Duration,
    timeout: Option<Duration>,
    started: Instant,
    stdout_task: Option<JoinHandle<io::Result<Captured>>>,
    stderr_task: Option<JoinHandle<io::Result<Vec<u8>>>>,
}

impl std::fmt::Debug for Captured {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streamed(n) => write!(f, "Streamed({n})"),
            Self::Buffered(buf) => write!(f, "Buffered({} bytes)", buf.len()),
        }
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn console_log(&self) -> &Path {
        &self.console_log
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollStatus {
    pub still_running: bool,
    pub exit_code: Option<i32>,
}

/// Passed to the tick callback.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    pub elapsed: Duration,
    pub count: u64,
}

/// Returned by the tick callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    /// Kill the process.
    Abort(String),
}

/// How the wait loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Exit code, or -1 when the process died from a signal.
    Exited(i32),
    TimedOut(Duration),
    Cancelled,
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub outcome: ProcessOutcome,
    pub duration: Duration,
    pub console_log: PathBuf,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub ticks: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ExternalProcessRunner {
    config: RunnerConfig,
}

impl ExternalProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Start the tool described by `request`.
    ///
    /// Fails without spawning when the executable or working directory is missing.
    pub fn launch(&self, request: &RunRequest) -> Result<ProcessHandle> {
        let executable = resolve_executable(&request.executable)?;
        if !request.working_dir.is_dir() {
            return Err(RunnerError::WorkingDirMissing(request.working_dir.clone()));
        }

        let invocation = assemble_invocation(
            &request.args,
            &request.working_dir,
            self.config.max_inline_args_len,
            &self.config.args_file_switch,
        )?;

        if let Some(parent) = request.console_log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::File::create(&request.console_log)?;

        let mut cmd = Command::new(&executable);
        cmd.args(invocation.argv())
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| {
            remove_args_file(&invocation);
            if source.kind() == io::ErrorKind::NotFound {
                RunnerError::ExecutableNotFound(executable.clone())
            } else {
                RunnerError::Spawn {
                    path: executable.clone(),
                    source,
                }
            }
        })?;
        let pid = child.id();

        info!(
            pid = pid.unwrap_or_default(),
            executable = %executable.display(),
            working_dir = %request.working_dir.display(),
            externalized_args = invocation.is_externalized(),
            capture_mode = self.config.capture_mode.as_str(),
            "tool launched"
        );

        let console_log = request.console_log.clone();
        let stdout_task = child.stdout.take().map(|stdout| match self.config.capture_mode {
            CaptureMode::File => {
                let path = console_log.clone();
                tokio::spawn(async move { stream_to_file(stdout, path).await.map(Captured::Streamed) })
            }
            CaptureMode::Memory => tokio::spawn(async move {
                read_bounded(stdout, MAX_OUTPUT_BYTES)
                    .await
                    .map(Captured::Buffered)
            }),
        });
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_bounded(stderr, MAX_OUTPUT_BYTES)));

        Ok(ProcessHandle {
            child,
            pid,
            invocation,
            console_log,
            capture_mode: self.config.capture_mode,
            poll_interval: request.poll_interval.max(Duration::from_millis(10)),
            timeout: request.timeout,
            started: Instant::now(),
            stdout_task,
            stderr_task,
        })
    }

    /// Non-blocking status check.
    pub fn poll_once(&self, handle: &mut ProcessHandle) -> Result<PollStatus> {
        Ok(match handle.child.try_wait()? {
            Some(status) => PollStatus {
                still_running: false,
                exit_code: Some(status.code().unwrap_or(-1)),
            },
            None => PollStatus {
                still_running: true,
                exit_code: None,
            },
        })
    }

    /// Wait for the process, invoking `on_tick` every poll interval.
    ///
    /// The callback runs on the wait loop and must return well within one
    /// interval. Output capture finishes before this returns, so the console
    /// log is complete afterwards.
    pub async fn wait<F>(
        &self,
        mut handle: ProcessHandle,
        cancel: &CancellationToken,
        mut on_tick: F,
    ) -> Result<ProcessExit>
    where
        F: FnMut(&Tick) -> TickControl,
    {
        let pid = handle.pid.unwrap_or_default();
        let deadline = handle.timeout.map(|limit| handle.started + limit);
        let mut next_tick = handle.started + handle.poll_interval;
        let mut next_heartbeat = handle.started + HEARTBEAT_INTERVAL;
        let mut ticks = 0u64;

        let outcome = loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let limit = handle.timeout.unwrap_or_default();
                    warn!(pid, timeout_sec = limit.as_secs(), "tool timed out; killing");
                    terminate(&mut handle.child, pid).await;
                    break ProcessOutcome::TimedOut(limit);
                }
            }

            let mut wake = next_tick.min(next_heartbeat);
            if let Some(deadline) = deadline {
                wake = wake.min(deadline);
            }

            tokio::select! {
                result = handle.child.wait() => {
                    let status = result?;
                    break ProcessOutcome::Exited(status.code().unwrap_or(-1));
                }
                () = cancel.cancelled() => {
                    info!(pid, "cancellation requested; killing tool");
                    terminate(&mut handle.child, pid).await;
                    break ProcessOutcome::Cancelled;
                }
                () = sleep_until(wake) => {
                    let now = Instant::now();
                    if now >= next_heartbeat {
                        info!(
                            pid,
                            elapsed_sec = (now - handle.started).as_secs(),
                            "tool still running"
                        );
                        next_heartbeat = now + HEARTBEAT_INTERVAL;
                    }
                    if now >= next_tick {
                        ticks += 1;
                        let tick = Tick {
                            elapsed: now - handle.started,
                            count: ticks,
                        };
                        if let TickControl::Abort(reason) = on_tick(&tick) {
                            warn!(pid, reason = %reason, "aborting tool");
                            terminate(&mut handle.child, pid).await;
                            break ProcessOutcome::Aborted(reason);
                        }
                        next_tick = now + handle.poll_interval;
                    }
                }
            }
        };

        let duration = handle.started.elapsed();
        let stdout = collect(handle.stdout_task.take(), "stdout", pid).await;
        let stderr = collect(handle.stderr_task.take(), "stderr", pid)
            .await
            .unwrap_or_default();

        let stdout_bytes = match stdout {
            Some(Captured::Streamed(n)) => n,
            Some(Captured::Buffered(buf)) => {
                write_console(&handle.console_log, &buf, false)?;
                buf.len() as u64
            }
            None => 0,
        };
        if !stderr.is_empty() {
            let mut block = STDERR_SEPARATOR.to_vec();
            block.extend_from_slice(&stderr);
            write_console(&handle.console_log, &block, true)?;
        }

        remove_args_file(&handle.invocation);

        info!(
            pid,
            outcome = ?outcome,
            duration_ms = duration.as_millis() as u64,
            stdout_bytes,
            stderr_bytes = stderr.len(),
            capture_mode = handle.capture_mode.as_str(),
            "tool finished"
        );

        Ok(ProcessExit {
            outcome,
            duration,
            console_log: handle.console_log,
            stdout_bytes,
            stderr_bytes: stderr.len() as u64,
            ticks,
        })
    }
}

async fn terminate(child: &mut Child, pid: u32) {
    if let Err(err) = child.kill().await {
        warn!(pid, error = %err, "failed to kill tool");
    }
}

async fn collect<T>(
    task: Option<JoinHandle<io::Result<T>>>,
    stream: &'static str,
    pid: u32,
) -> Option<T> {
    match timeout(IO_CAPTURE_TIMEOUT, task?).await {
        Ok(Ok(Ok(value))) => Some(value),
        Ok(Ok(Err(err))) => {
            warn!(pid, stream, error = %err, "output capture failed");
            None
        }
        Ok(Err(err)) => {
            warn!(pid, stream, error = %err, "output capture task panicked");
            None
        }
        Err(_) => {
            warn!(pid, stream, "output capture timed out");
            None
        }
    }
}

fn write_console(path: &Path, bytes: &[u8], append: bool) -> io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use harness_core::{JobKey, OutputDescriptor};
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        path
    }

    fn request(dir: &Path, executable: &Path, args: Vec<String>) -> RunRequest {
        RunRequest::new(
            executable,
            dir,
            JobKey::new("Dataset", 1, 1),
            OutputDescriptor::file("out.txt"),
        )
        .with_args(args)
        .with_poll_interval(Duration::from_millis(50))
    }

    /// Echoes its arguments, reading them from the file when given `/R:<file>`.
    const ECHO_ARGS: &str = r#"if [ "${1#/R:}" != "$1" ]; then
    set -- $(cat "${1#/R:}")
fi
echo "ARGS: $*"
"#;

    fn args_of_len(len: usize) -> Vec<String> {
        let mut args = Vec::new();
        let mut joined = 0;
        let mut i = 0;
        while joined < len {
            let arg = format!("/X{i}:value");
            joined += arg.len() + usize::from(!args.is_empty());
            args.push(arg);
            i += 1;
        }
        args
    }

    #[test]
    fn join_args_quotes_whitespace() {
        let args = vec![
            "/I:C:\\data\\my file.raw".to_string(),
            "/SF:10".to_string(),
            String::new(),
        ];
        assert_eq!(join_args(&args), "\"/I:C:\\data\\my file.raw\" /SF:10 \"\"");
    }

    #[test]
    fn short_arguments_stay_inline() {
        let dir = TempDir::new().unwrap();
        let args = args_of_len(100);
        let invocation = assemble_invocation(&args, dir.path(), 250, "/R:").unwrap();
        assert_eq!(invocation, Invocation::Inline(args));
    }

    #[test]
    fn long_arguments_go_to_args_file() {
        let dir = TempDir::new().unwrap();
        let args = args_of_len(300);
        let invocation = assemble_invocation(&args, dir.path(), 250, "/R:").unwrap();

        let Invocation::ArgsFile { path, switch_arg } = &invocation else {
            panic!("expected args file, got {invocation:?}");
        };
        assert_eq!(switch_arg, &format!("/R:{}", path.display()));
        assert_eq!(std::fs::read_to_string(path).unwrap(), join_args(&args));
        assert_eq!(invocation.argv(), vec![switch_arg.clone()]);
    }

    #[test]
    fn resolve_executable_searches_path() {
        assert!(resolve_executable(Path::new("sh")).is_ok());
        assert!(matches!(
            resolve_executable(Path::new("definitely_not_a_tool_xyz")),
            Err(RunnerError::ExecutableNotFound(_))
        ));
        assert!(matches!(
            resolve_executable(Path::new("/no/such/dir/tool.exe")),
            Err(RunnerError::ExecutableNotFound(_))
        ));
    }

    #[test]
    fn launch_missing_executable_fails_without_spawning() {
        let dir = TempDir::new().unwrap();
        let runner = ExternalProcessRunner::default();
        let req = request(dir.path(), &dir.path().join("missing.exe"), vec![]);
        assert!(matches!(
            runner.launch(&req),
            Err(RunnerError::ExecutableNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn failed_spawn_removes_args_file() {
        let dir = TempDir::new().unwrap();
        // Present but not executable: resolves, then fails to spawn.
        let tool = dir.path().join("not_executable.sh");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        let runner = ExternalProcessRunner::new(RunnerConfig {
            max_inline_args_len: 10,
            ..RunnerConfig::default()
        });

        let req = request(dir.path(), &tool, args_of_len(100));
        assert!(matches!(runner.launch(&req), Err(RunnerError::Spawn { .. })));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("harness_args_"))
            .collect();
        assert!(leftovers.is_empty(), "argument file left behind: {leftovers:?}");
    }

    #[test]
    fn relative_executable_paths_become_absolute() {
        let resolved = resolve_executable(Path::new("src/runner.rs")).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("src/runner.rs"));
    }

    #[tokio::test]
    async fn wait_reports_exit_code_and_captures_output() {
        let dir = TempDir::new().unwrap();
        let tool = write_script(dir.path(), "tool.sh", "echo 'hello'\necho 'oops' >&2\nexit 3\n");
        let runner = ExternalProcessRunner::default();
        let handle = runner.launch(&request(dir.path(), &tool, vec![])).unwrap();

        let exit = runner
            .wait(handle, &CancellationToken::new(), |_| TickControl::Continue)
            .await
            .unwrap();

        assert_eq!(exit.outcome, ProcessOutcome::Exited(3));
        let log = std::fs::read_to_string(&exit.console_log).unwrap();
        assert!(log.starts_with("hello\n"));
        assert!(log.contains("--- STDERR ---\noops"));
    }

    #[tokio::test]
    async fn memory_capture_flushes_at_exit() {
        let dir = TempDir::new().unwrap();
        let tool = write_script(dir.path(), "tool.sh", "echo 'buffered line'\n");
        let runner = ExternalProcessRunner::new(RunnerConfig {
            capture_mode: CaptureMode::Memory,
            ..RunnerConfig::default()
        });
        let handle = runner.launch(&request(dir.path(), &tool, vec![])).unwrap();
        let exit = runner
            .wait(handle, &CancellationToken::new(), |_| TickControl::Continue)
            .await
            .unwrap();

        assert_eq!(exit.outcome, ProcessOutcome::Exited(0));
        assert_eq!(exit.stdout_bytes, 14);
        assert_eq!(
            std::fs::read_to_string(&exit.console_log).unwrap(),
            "buffered line\n"
        );
    }

    #[tokio::test]
    async fn ticks_see_partial_output_while_running() {
        let dir = TempDir::new().unwrap();
        let tool = write_script(
            dir.path(),
            "tool.sh",
            "echo 'first'\nsleep 0.5\necho 'second'\n",
        );
        let runner = ExternalProcessRunner::default();
        let handle = runner.launch(&request(dir.path(), &tool, vec![])).unwrap();
        let log = handle.console_log().to_path_buf();

        let mut seen_first_only = false;
        let exit = runner
            .wait(handle, &CancellationToken::new(), |_| {
                let text = std::fs::read_to_string(&log).unwrap_or_default();
                if text.contains("first") && !text.contains("second") {
                    seen_first_only = true;
                }
                TickControl::Continue
            })
            .await
            .unwrap();

        assert!(exit.ticks >= 2);
        assert!(seen_first_only, "partial output was not visible during the run");
    }

    #[tokio::test]
    async fn timeout_kills_the_tool() {
        let dir = TempDir::new().unwrap();
        let tool = write_script(dir.path(), "tool.sh", "exec sleep 5\n");
        let runner = ExternalProcessRunner::default();
        let req = request(dir.path(), &tool, vec![]).with_timeout(Some(Duration::from_millis(200)));
        let handle = runner.launch(&req).unwrap();

        let exit = runner
            .wait(handle, &CancellationToken::new(), |_| TickControl::Continue)
            .await
            .unwrap();
        assert_eq!(
            exit.outcome,
            ProcessOutcome::TimedOut(Duration::from_millis(200))
        );
        assert!(exit.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_kills_the_tool() {
        let dir = TempDir::new().unwrap();
        let tool = write_script(dir.path(), "tool.sh", "exec sleep 5\n");
        let runner = ExternalProcessRunner::default();
        let handle = runner.launch(&request(dir.path(), &tool, vec![])).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let exit = runner
            .wait(handle, &cancel, |_| TickControl::Continue)
            .await
            .unwrap();
        assert_eq!(exit.outcome, ProcessOutcome::Cancelled);
    }

    #[tokio::test]
    async fn tick_abort_kills_the_tool() {
        let dir = TempDir::new().unwrap();
        let tool = write_script(dir.path(), "tool.sh", "exec sleep 5\n");
        let runner = ExternalProcessRunner::default();
        let handle = runner.launch(&request(dir.path(), &tool, vec![])).unwrap();

        let exit = runner
            .wait(handle, &CancellationToken::new(), |tick| {
                if tick.count >= 2 {
                    TickControl::Abort("fatal error in console".to_string())
                } else {
                    TickControl::Continue
                }
            })
            .await
            .unwrap();
        assert_eq!(
            exit.outcome,
            ProcessOutcome::Aborted("fatal error in console".to_string())
        );
        assert_eq!(exit.ticks, 2);
    }

    #[tokio::test]
    async fn poll_once_tracks_running_state() {
        let dir = TempDir::new().unwrap();
        let tool = write_script(dir.path(), "tool.sh", "sleep 0.3\nexit 0\n");
        let runner = ExternalProcessRunner::default();
        let mut handle = runner.launch(&request(dir.path(), &tool, vec![])).unwrap();

        let first = runner.poll_once(&mut handle).unwrap();
        assert!(first.still_running);
        assert_eq!(first.exit_code, None);

        tokio::time::sleep(Duration::from_millis(800)).await;
        let later = runner.poll_once(&mut handle).unwrap();
        assert!(!later.still_running);
        assert_eq!(later.exit_code, Some(0));
    }

    #[tokio::test]
    async fn externalized_and_inline_arguments_behave_the_same() {
        let dir = TempDir::new().unwrap();
        let tool = write_script(dir.path(), "echo_args.sh", ECHO_ARGS);
        let runner = ExternalProcessRunner::default();

        let mut logs = Vec::new();
        for len in [100, 300] {
            let args = args_of_len(len);
            let expected = format!("ARGS: {}\n", args.join(" "));
            let req = request(dir.path(), &tool, args)
                .with_console_log(dir.path().join(format!("console_{len}.txt")));
            let handle = runner.launch(&req).unwrap();
            assert_eq!(handle.invocation().is_externalized(), len > 250);
            let args_file = match handle.invocation() {
                Invocation::ArgsFile { path, .. } => Some(path.clone()),
                Invocation::Inline(_) => None,
            };

            let exit = runner
                .wait(handle, &CancellationToken::new(), |_| TickControl::Continue)
                .await
                .unwrap();
            assert_eq!(exit.outcome, ProcessOutcome::Exited(0));
            let log = std::fs::read_to_string(&exit.console_log).unwrap();
            assert_eq!(log, expected);
            logs.push(log.len());

            if let Some(path) = args_file {
                assert!(!path.exists(), "argument file should be removed after exit");
            }
        }
        assert_eq!(logs.len(), 2);
    }
}
