//! External command execution.
//!
//! Every command runs from an argv vector; there is no shell in the path.
//! The child is placed in its own process group so a timeout can signal the
//! whole tree: `SIGTERM` first, then `SIGKILL` if the group is still alive
//! one second later.

use crate::error::{CallError, Errno};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Grace period between `SIGTERM` and `SIGKILL` on timeout.
pub const KILL_GRACE: Duration = Duration::from_secs(1);

/// Description of one command invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Bytes written to the child's stdin, which is `/dev/null` otherwise.
    pub input: Option<Vec<u8>>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
    /// Absolute wall-clock limit.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Build a spec from an argv vector.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Feed `input` to the child's stdin.
    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Set an environment variable for the child.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Enforce a wall-clock timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program name, or the empty string for an empty argv.
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    /// The argv joined by spaces, for logs.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Captured result of a command that ran to completion or was killed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code; `128 + signal` when the child died from a signal.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
    /// Whether the timeout fired.
    pub timed_out: bool,
}

impl ExecOutput {
    /// Whether the command exited zero within its timeout.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Stdout decoded lossily.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded lossily and trimmed.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Details of a command that ran but did not succeed.
#[derive(Debug, Clone)]
pub struct CommandFailureInfo {
    /// The command line.
    pub command: String,
    /// Exit code.
    pub exit_code: i32,
    /// Whether the timeout fired.
    pub timed_out: bool,
    /// Captured stderr.
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.timed_out {
            write!(f, "Command [{}] timed out", self.command)?;
        } else {
            write!(
                f,
                "Command [{}] failed with exit code {}",
                self.command, self.exit_code
            )?;
        }
        if !self.stderr.is_empty() {
            write!(f, ": {}", self.stderr)?;
        }
        Ok(())
    }
}

/// Executor errors.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The argv vector was empty.
    #[error("empty command")]
    EmptyCommand,

    /// The process could not be spawned.
    #[error("failed to start [{command}]: {source}")]
    Spawn {
        /// The command line.
        command: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// I/O failure while talking to the child.
    #[error("I/O error running [{command}]: {source}")]
    Io {
        /// The command line.
        command: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The command ran and failed.
    #[error("{0}")]
    Failed(Box<CommandFailureInfo>),
}

impl From<ExecError> for CallError {
    fn from(err: ExecError) -> Self {
        let errno = match &err {
            ExecError::EmptyCommand => Errno::EINVAL,
            ExecError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                Errno::ENOENT
            }
            ExecError::Failed(info) if info.timed_out => Errno::ETIMEDOUT,
            _ => Errno::EFAULT,
        };
        CallError::new(errno, err.to_string())
    }
}

/// Convert a non-successful output into an [`ExecError::Failed`].
pub fn output_to_exec_error(spec: &CommandSpec, output: &ExecOutput) -> ExecError {
    ExecError::Failed(Box::new(CommandFailureInfo {
        command: spec.display(),
        exit_code: output.exit_code,
        timed_out: output.timed_out,
        stderr: output.stderr_str(),
    }))
}

/// Something that runs external commands.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run to completion (or timeout) and capture both streams.
    async fn run(&self, spec: CommandSpec) -> Result<ExecOutput, ExecError>;

    /// Start the command and return as soon as it is spawned.
    fn spawn_detached(&self, spec: CommandSpec) -> Result<(), ExecError>;
}

/// Run and require a zero exit code.
pub async fn execute(runner: &dyn Runner, spec: CommandSpec) -> Result<ExecOutput, ExecError> {
    let output = runner.run(spec.clone()).await?;
    if !output.success() {
        return Err(output_to_exec_error(&spec, &output));
    }
    Ok(output)
}

/// Executor backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    default_timeout: Option<Duration>,
}

impl SystemExecutor {
    /// Create an executor with no default timeout.
    pub fn new() -> Self {
        Self {
            default_timeout: None,
        }
    }

    /// Apply `timeout` to specs that carry none.
    pub fn with_default_timeout(timeout: Duration) -> Self {
        Self {
            default_timeout: Some(timeout),
        }
    }

    fn command(spec: &CommandSpec) -> Result<tokio::process::Command, ExecError> {
        let (program, args) = spec.argv.split_first().ok_or(ExecError::EmptyCommand)?;
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        Ok(cmd)
    }
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn signal_group(pgid: i32, signal: libc::c_int) {
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        debug!(
            pgid,
            signal,
            error = %std::io::Error::last_os_error(),
            "killpg failed"
        );
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

async fn read_all<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut r) = reader {
        r.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

#[async_trait]
impl Runner for SystemExecutor {
    async fn run(&self, spec: CommandSpec) -> Result<ExecOutput, ExecError> {
        let command = spec.display();
        let mut cmd = Self::command(&spec)?;
        cmd.stdin(if spec.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

        debug!(command = %command, "executing");
        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            command: command.clone(),
            source,
        })?;
        let pgid = child.id().map(|p| p as i32);

        let stdin = child.stdin.take();
        let input = spec.input.clone();
        let writer = tokio::spawn(async move {
            if let (Some(mut stdin), Some(input)) = (stdin, input) {
                // A child that exits without reading its input yields EPIPE.
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            }
        });
        let stdout = tokio::spawn(read_all(child.stdout.take()));
        let stderr = tokio::spawn(read_all(child.stderr.take()));

        let timeout = spec.timeout.or(self.default_timeout);
        let mut timed_out = false;
        let status = match timeout {
            None => child.wait().await,
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    timed_out = true;
                    warn!(command = %command, ?limit, "command timed out, terminating process group");
                    if let Some(pgid) = pgid {
                        signal_group(pgid, libc::SIGTERM);
                    }
                    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            if let Some(pgid) = pgid {
                                signal_group(pgid, libc::SIGKILL);
                            }
                            let _ = child.start_kill();
                            child.wait().await
                        }
                    }
                }
            },
        }
        .map_err(|source| ExecError::Io {
            command: command.clone(),
            source,
        })?;

        let _ = writer.await;
        let io_err = |source: std::io::Error| ExecError::Io {
            command: command.clone(),
            source,
        };
        let join_err = |e: tokio::task::JoinError| std::io::Error::new(std::io::ErrorKind::Other, e);
        let stdout = stdout.await.map_err(join_err).map_err(io_err)?.map_err(io_err)?;
        let stderr = stderr.await.map_err(join_err).map_err(io_err)?.map_err(io_err)?;

        Ok(ExecOutput {
            exit_code: exit_code(status),
            stdout,
            stderr,
            timed_out,
        })
    }

    fn spawn_detached(&self, spec: CommandSpec) -> Result<(), ExecError> {
        let command = spec.display();
        let mut cmd = Self::command(&spec)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0);
        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            command: command.clone(),
            source,
        })?;
        debug!(command = %command, pid = ?child.id(), "spawned detached command");
        tokio::spawn(async move {
            if let Err(e) = child.wait().await {
                warn!(command = %command, error = %e, "failed to reap detached command");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_run_captures_streams() {
        let exec = SystemExecutor::new();
        let out = exec
            .run(CommandSpec::new(["sh", "-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout_str(), "out\n");
        assert_eq!(out.stderr_str(), "err");
        assert!(!out.timed_out);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_run_feeds_stdin() {
        let exec = SystemExecutor::new();
        let out = exec
            .run(CommandSpec::new(["cat"]).with_input(b"hello".to_vec()))
            .await
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, b"hello");
    }

    #[tokio::test]
    async fn test_stdin_is_null_without_input() {
        let exec = SystemExecutor::new();
        let out = exec.run(CommandSpec::new(["cat"])).await.unwrap();
        assert!(out.success());
        assert!(out.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_terminates_group() {
        let exec = SystemExecutor::new();
        let start = Instant::now();
        let out = exec
            .run(CommandSpec::new(["sleep", "30"]).with_timeout(Duration::from_millis(200)))
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, 128 + libc::SIGTERM);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_escalates_to_kill() {
        let exec = SystemExecutor::new();
        let start = Instant::now();
        let out = exec
            .run(
                CommandSpec::new(["sh", "-c", "trap '' TERM; sleep 30"])
                    .with_timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap();
        assert!(out.timed_out);
        assert!(start.elapsed() >= KILL_GRACE);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_no_shell_expansion() {
        let exec = SystemExecutor::new();
        let out = exec
            .run(CommandSpec::new(["echo", "$HOME;", "`id`"]))
            .await
            .unwrap();
        assert_eq!(out.stdout_str(), "$HOME; `id`\n");
    }

    #[tokio::test]
    async fn test_missing_program_is_enoent() {
        let exec = SystemExecutor::new();
        let err = exec
            .run(CommandSpec::new(["/nonexistent/hastor-binary"]))
            .await
            .unwrap_err();
        let call: CallError = err.into();
        assert_eq!(call.errno, Errno::ENOENT);
    }

    #[tokio::test]
    async fn test_empty_command() {
        let exec = SystemExecutor::new();
        let err = exec.run(CommandSpec::default()).await.unwrap_err();
        assert!(matches!(err, ExecError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_execute_requires_success() {
        let exec = SystemExecutor::new();
        let err = execute(&exec, CommandSpec::new(["false"])).await.unwrap_err();
        match err {
            ExecError::Failed(info) => {
                assert_eq!(info.exit_code, 1);
                assert_eq!(info.command, "false");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_detached_returns_immediately() {
        let exec = SystemExecutor::new();
        let start = Instant::now();
        exec.spawn_detached(CommandSpec::new(["sleep", "2"])).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
