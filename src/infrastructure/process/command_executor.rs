use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::output_buffer::{OutputBuffer, DEFAULT_MAX_LINES, DEFAULT_MAX_LINE_LENGTH};

/// How long captured output is still drained after a child was killed
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// State of a process execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    NotRun,
    Finished,
    Interrupted,
    Errored,
    TimedOut,
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::NotRun => "not run",
            ExecutionState::Finished => "finished",
            ExecutionState::Interrupted => "interrupted",
            ExecutionState::Errored => "errored",
            ExecutionState::TimedOut => "timed out",
        };
        write!(f, "{}", name)
    }
}

/// Resource limits that can be applied to a child before exec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimit {
    NoFile,
    Core,
    Cpu,
}

impl ResourceLimit {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "RLIMIT_NOFILE" => Some(ResourceLimit::NoFile),
            "RLIMIT_CORE" => Some(ResourceLimit::Core),
            "RLIMIT_CPU" => Some(ResourceLimit::Cpu),
            _ => None,
        }
    }

    /// Runs between fork and exec, so it must not allocate.
    #[cfg(unix)]
    fn apply(self, value: u64) -> std::io::Result<()> {
        let resource = match self {
            ResourceLimit::NoFile => libc::RLIMIT_NOFILE,
            ResourceLimit::Core => libc::RLIMIT_CORE,
            ResourceLimit::Cpu => libc::RLIMIT_CPU,
        };
        let limit = libc::rlimit {
            rlim_cur: value as libc::rlim_t,
            rlim_max: value as libc::rlim_t,
        };
        // SAFETY: setrlimit only reads the struct passed by reference.
        if unsafe { libc::setrlimit(resource, &limit) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Description of one external command execution
#[derive(Debug, Clone)]
pub struct ProcessDescriptor {
    /// Argument vector, program first
    pub args: Vec<String>,

    /// Working directory of the child; the caller's own directory never changes
    pub working_directory: Option<PathBuf>,

    /// Variables added to the inherited environment
    pub env: HashMap<String, String>,

    pub timeout: Option<Duration>,

    /// Limit name (e.g. `RLIMIT_NOFILE`) to value
    pub resource_limits: BTreeMap<String, u64>,

    /// Capture stderr together with stdout
    pub redirect_stderr: bool,

    pub max_line_length: usize,
    pub max_lines: usize,

    /// Pattern to value; values starting with `$` name an environment variable
    pub substitutions: BTreeMap<String, String>,

    pub append: Vec<String>,

    /// Append only when no substitution happened
    pub exclusive_substitution: bool,

    /// Log every captured line at info level as it arrives
    pub log_output: bool,

    pub cancellation: Option<CancellationToken>,
}

impl ProcessDescriptor {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            working_directory: None,
            env: HashMap::new(),
            timeout: None,
            resource_limits: BTreeMap::new(),
            redirect_stderr: true,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            max_lines: DEFAULT_MAX_LINES,
            substitutions: BTreeMap::new(),
            append: Vec::new(),
            exclusive_substitution: false,
            log_output: false,
            cancellation: None,
        }
    }

    pub fn with_working_directory<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.working_directory = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_env(mut self, env: &HashMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn with_environment_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_resource_limits(mut self, limits: &BTreeMap<String, u64>) -> Self {
        self.resource_limits
            .extend(limits.iter().map(|(k, v)| (k.clone(), *v)));
        self
    }

    pub fn with_separate_stderr(mut self) -> Self {
        self.redirect_stderr = false;
        self
    }

    pub fn with_output_limits(mut self, max_lines: usize, max_line_length: usize) -> Self {
        self.max_lines = max_lines;
        self.max_line_length = max_line_length;
        self
    }

    pub fn with_substitution(mut self, pattern: impl Into<String>, value: impl Into<String>) -> Self {
        self.substitutions.insert(pattern.into(), value.into());
        self
    }

    pub fn with_append(mut self, args: Vec<String>, exclusive: bool) -> Self {
        self.append = args;
        self.exclusive_substitution = exclusive;
        self
    }

    pub fn with_log_output(mut self, log_output: bool) -> Self {
        self.log_output = log_output;
        self
    }

    pub fn with_cancellation(mut self, token: Option<CancellationToken>) -> Self {
        self.cancellation = token;
        self
    }

    /// Argument vector after substitution and appending
    pub fn command_line(&self) -> Vec<String> {
        fill_args(
            &self.args,
            &self.substitutions,
            &self.append,
            self.exclusive_substitution,
        )
    }
}

/// Replace every occurrence of each pattern in every argument.
///
/// Empty values are skipped. Appended arguments are added unless
/// `exclusive` is set and at least one substitution happened.
pub fn fill_args(
    args: &[String],
    substitutions: &BTreeMap<String, String>,
    append: &[String],
    exclusive: bool,
) -> Vec<String> {
    let mut substituted = false;
    let mut filled: Vec<String> = args
        .iter()
        .map(|arg| {
            let mut new_arg = arg.clone();
            for (pattern, value) in substitutions {
                if value.is_empty() || !new_arg.contains(pattern.as_str()) {
                    continue;
                }
                let value = resolve_value(value);
                debug!("replacing '{}' in '{}' with '{}'", pattern, new_arg, value);
                new_arg = new_arg.replace(pattern.as_str(), &value);
                substituted = true;
            }
            new_arg
        })
        .collect();

    if !append.is_empty() && (!exclusive || !substituted) {
        filled.extend(append.iter().cloned());
    }
    filled
}

fn resolve_value(value: &str) -> String {
    match value.strip_prefix('$') {
        Some(var) => std::env::var(var).unwrap_or_default(),
        None => value.to_string(),
    }
}

/// Whether `path` is a regular file the current user may execute
pub fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Result of one process execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Argument vector that was run (after substitution)
    pub command: Vec<String>,
    pub working_directory: Option<PathBuf>,
    pub state: ExecutionState,
    exit_code: Option<i32>,
    /// Captured lines without their `\n` or `\r\n` terminator
    pub stdout: Vec<String>,
    /// Empty when stderr was redirected into stdout
    pub stderr: Vec<String>,
    pub pid: Option<u32>,
    pub elapsed: Duration,
}

impl ExecutionResult {
    fn not_run(command: Vec<String>, working_directory: Option<PathBuf>) -> Self {
        Self {
            command,
            working_directory,
            state: ExecutionState::NotRun,
            exit_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            pid: None,
            elapsed: Duration::ZERO,
        }
    }

    /// Exit code; only available once the process finished
    pub fn exit_code(&self) -> Option<i32> {
        match self.state {
            ExecutionState::Finished => self.exit_code,
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == Some(0)
    }

    pub fn command_string(&self) -> String {
        self.command.join(" ")
    }

    /// Captured lines, each terminated by `\n`.
    ///
    /// Line endings are normalized, so CRLF output or a missing final newline
    /// does not round-trip byte for byte.
    pub fn output_string(&self) -> String {
        join_lines(&self.stdout)
    }

    pub fn error_output_string(&self) -> String {
        join_lines(&self.stderr)
    }

    /// Stdout followed by stderr
    pub fn combined_output(&self) -> String {
        let mut output = self.output_string();
        output.push_str(&self.error_output_string());
        output
    }

    /// Log the command line, directory and outcome at error level.
    pub fn log_error(&self, message: &str) {
        let directory = self
            .working_directory
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|| ".".to_string());
        match self.exit_code() {
            Some(code) => error!(
                "{}: command '{}' in directory {} exited with {}",
                message,
                self.command_string(),
                directory,
                code
            ),
            None => error!(
                "{}: command '{}' in directory {} ended with invalid state {}",
                message,
                self.command_string(),
                directory,
                self.state
            ),
        }
    }
}

fn join_lines(lines: &[String]) -> String {
    let mut joined = String::new();
    for line in lines {
        joined.push_str(line);
        joined.push('\n');
    }
    joined
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

enum WaitOutcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs external processes with bounded output capture and timeout escalation
pub struct CommandExecutor;

impl CommandExecutor {
    /// Execute a single command. Never fails; problems are reported through
    /// [`ExecutionResult::state`].
    pub async fn execute(descriptor: &ProcessDescriptor) -> ExecutionResult {
        let command = descriptor.command_line();
        let mut result = ExecutionResult::not_run(command.clone(), descriptor.working_directory.clone());

        let Some((program, args)) = command.split_first() else {
            error!("cannot execute empty command");
            result.state = ExecutionState::Errored;
            return result;
        };

        let mut cmd = TokioCommand::new(program);
        cmd.args(args);

        if let Some(dir) = &descriptor.working_directory {
            if !dir.is_dir() {
                error!("Cannot change working directory to {}", dir.display());
                result.state = ExecutionState::Errored;
                return result;
            }
            cmd.current_dir(dir);
        }

        if !descriptor.env.is_empty() {
            debug!("environment variables: {:?}", descriptor.env);
            cmd.envs(&descriptor.env);
        }

        let mut limits = Vec::new();
        for (name, value) in &descriptor.resource_limits {
            match ResourceLimit::from_name(name) {
                Some(limit) => limits.push((limit, *value)),
                None => {
                    error!("unknown resource limit '{}' for command '{}'", name, result.command_string());
                    result.state = ExecutionState::Errored;
                    return result;
                }
            }
        }
        if !limits.is_empty() {
            Self::set_resource_limits(&mut cmd, limits);
        }

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(
            "command = '{}' (working directory = {:?})",
            result.command_string(),
            descriptor.working_directory
        );

        let start_time = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("Failed to spawn '{}': {}", result.command_string(), e);
                result.state = ExecutionState::Errored;
                return result;
            }
        };
        result.pid = child.id();
        debug!("Waiting for process with PID {:?}", result.pid);

        let (readers, collector) = Self::start_capture(&mut child, descriptor);

        let outcome = {
            let timeout = async {
                match descriptor.timeout {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => std::future::pending::<()>().await,
                }
            };
            let cancelled = async {
                match &descriptor.cancellation {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                status = child.wait() => WaitOutcome::Exited(status),
                _ = timeout => WaitOutcome::TimedOut,
                _ = cancelled => WaitOutcome::Cancelled,
            }
        };

        match outcome {
            WaitOutcome::Exited(Ok(status)) => {
                result.state = ExecutionState::Finished;
                result.exit_code = Some(exit_code_of(status));
                debug!("'{}' -> {:?}", result.command_string(), result.exit_code);
            }
            WaitOutcome::Exited(Err(e)) => {
                error!("Failed to wait for '{}': {}", result.command_string(), e);
                result.state = ExecutionState::Errored;
            }
            WaitOutcome::TimedOut => {
                let timeout = descriptor.timeout.unwrap_or_default();
                info!(
                    "Terminating command '{}' with PID {:?} after timeout of {:?}",
                    result.command_string(),
                    result.pid,
                    timeout
                );
                Self::terminate(&mut child, timeout).await;
                error!("Timed out");
                result.state = ExecutionState::TimedOut;
            }
            WaitOutcome::Cancelled => {
                info!("Interrupting command '{}' with PID {:?}", result.command_string(), result.pid);
                if let Err(e) = child.kill().await {
                    error!("Cannot kill PID {:?}: {}", result.pid, e);
                }
                result.state = ExecutionState::Interrupted;
            }
        }

        debug!("Waiting on output readers to finish reading");
        let (stdout, stderr) = if result.state == ExecutionState::Finished {
            Self::finish_capture(collector).await
        } else {
            match tokio::time::timeout(DRAIN_GRACE, Self::finish_capture_ref(&readers)).await {
                Ok(()) => Self::finish_capture(collector).await,
                Err(_) => {
                    debug!("output pipes still open after the process was gone, abandoning them");
                    for reader in &readers {
                        reader.abort();
                    }
                    Self::finish_capture(collector).await
                }
            }
        };
        result.stdout = stdout;
        result.stderr = stderr;

        result.elapsed = start_time.elapsed();
        debug!("Command '{}' took {:?}", result.command_string(), result.elapsed);
        result
    }

    #[cfg(unix)]
    fn set_resource_limits(cmd: &mut TokioCommand, limits: Vec<(ResourceLimit, u64)>) {
        // SAFETY: the closure only calls setrlimit, which is async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                for (limit, value) in &limits {
                    limit.apply(*value)?;
                }
                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    fn set_resource_limits(_cmd: &mut TokioCommand, limits: Vec<(ResourceLimit, u64)>) {
        tracing::warn!("resource limits {:?} are not supported on this platform", limits);
    }

    /// Spawn one reader per pipe plus a collector owning the bounded buffers.
    fn start_capture(
        child: &mut Child,
        descriptor: &ProcessDescriptor,
    ) -> (Vec<JoinHandle<()>>, JoinHandle<(OutputBuffer, OutputBuffer)>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<(Stream, String)>();
        let mut readers = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_lines(stdout, Stream::Stdout, sender.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_lines(stderr, Stream::Stderr, sender.clone())));
        }
        drop(sender);

        let redirect_stderr = descriptor.redirect_stderr;
        let log_output = descriptor.log_output;
        let (max_lines, max_line_length) = (descriptor.max_lines, descriptor.max_line_length);
        let collector = tokio::spawn(async move {
            let mut out = OutputBuffer::new(max_lines, max_line_length);
            let mut err = OutputBuffer::new(max_lines, max_line_length);
            while let Some((stream, line)) = receiver.recv().await {
                if log_output {
                    info!("{}", line);
                }
                match stream {
                    Stream::Stderr if !redirect_stderr => err.push(line),
                    _ => out.push(line),
                }
            }
            debug!("end of output");
            (out, err)
        });

        (readers, collector)
    }

    async fn finish_capture_ref(readers: &[JoinHandle<()>]) {
        while readers.iter().any(|reader| !reader.is_finished()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn finish_capture(
        collector: JoinHandle<(OutputBuffer, OutputBuffer)>,
    ) -> (Vec<String>, Vec<String>) {
        match collector.await {
            Ok((out, err)) => (out.into_lines(), err.into_lines()),
            Err(e) => {
                error!("output collector failed: {}", e);
                (Vec::new(), Vec::new())
            }
        }
    }

    /// Make sure the process goes away: terminate, then on POSIX interrupt
    /// and kill, halving the wait before each further signal.
    async fn terminate(child: &mut Child, timeout: Duration) {
        let pid = child.id();
        info!("Terminating PID {:?}", pid);

        #[cfg(unix)]
        {
            send_signal(pid, libc::SIGTERM);
            let mut remaining = timeout;
            for signal in [libc::SIGINT, libc::SIGKILL] {
                remaining /= 2;
                match tokio::time::timeout(remaining, child.wait()).await {
                    Ok(_) => {
                        info!("Command with PID {:?} is gone", pid);
                        return;
                    }
                    Err(_) => {
                        info!("Command with PID {:?} still alive, killing with signal {}", pid, signal);
                        send_signal(pid, signal);
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = timeout;
            if let Err(e) = child.start_kill() {
                error!("Cannot kill PID {:?}: {}", pid, e);
            }
        }

        if let Err(e) = child.wait().await {
            error!("Failed to reap PID {:?}: {}", pid, e);
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: Option<u32>, signal: libc::c_int) {
    let Some(pid) = pid else {
        return;
    };
    // SAFETY: kill(2) has no memory safety requirements.
    if unsafe { libc::kill(pid as libc::pid_t, signal) } != 0 {
        debug!(
            "cannot send signal {} to PID {}: {}",
            signal,
            pid,
            std::io::Error::last_os_error()
        );
    }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    -1
}

async fn read_lines<R>(pipe: R, stream: Stream, sender: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                if buf.ends_with(b"\n") {
                    buf.pop();
                    if buf.ends_with(b"\r") {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if sender.send((stream, line)).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("error reading {:?}: {}", stream, e);
                return;
            }
        }
    }
}
