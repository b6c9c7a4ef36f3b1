//! Low-level command bridge to a remote device.
//!
//! Everything the crate does to a device goes through the host's `adb`
//! executable. This module wraps that in two shapes:
//!
//! - [`AdbCommand::exec`]: run to completion and collect output
//! - [`AdbCommand::stream`]: run and iterate output line by line via
//!   [`LineStream`], with an optional per-line unresponsiveness timeout
//!
//! A [`LineStream`] owns the child process and guarantees the process is
//! terminated when the stream is dropped, so cancelling a task that is
//! mid-iteration never leaks an adb subprocess.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout};
use tracing::debug;

/// Default timeout for short-lived adb commands.
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for long-running adb commands (install, screen capture, ...).
pub const LONG_CMD_TIMEOUT: Duration = Duration::from_secs(4 * 60);

/// Errors from executing a bridge command.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The remote command completed with a failing exit code.
    #[error("command '{command}' failed with code {code} [{message}]")]
    Failed {
        command: String,
        code: i32,
        message: String,
    },

    /// The command (or a single line read) did not complete in time.
    #[error("command '{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a completed bridge command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    /// Check whether the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Builder for a single adb invocation against one device.
///
/// # Example
///
/// ```no_run
/// use corral::bridge::AdbCommand;
///
/// # async fn example() -> Result<(), corral::bridge::CommandError> {
/// let output = AdbCommand::new("/sdk/platform-tools/adb", Some("emulator-5554"))
///     .arg("shell")
///     .arg("getprop")
///     .arg("sys.boot_completed")
///     .exec()
///     .await?;
/// assert!(output.success());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct AdbCommand {
    adb: PathBuf,
    serial: Option<String>,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl AdbCommand {
    /// Create a command for the given adb executable and optional device serial.
    pub fn new(adb: impl Into<PathBuf>, serial: Option<&str>) -> Self {
        Self {
            adb: adb.into(),
            serial: serial.map(str::to_string),
            args: Vec::new(),
            timeout: Some(DEFAULT_CMD_TIMEOUT),
        }
    }

    /// Add an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the overall timeout, or `None` to wait indefinitely.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Render the full command line, for diagnostics.
    pub fn display(&self) -> String {
        let mut parts = vec![self.adb.display().to_string()];
        if let Some(serial) = &self.serial {
            parts.push("-s".to_string());
            parts.push(serial.clone());
        }
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn build(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.adb);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.args(&self.args);
        cmd
    }

    /// Execute the command and wait for completion.
    ///
    /// A non-zero exit code is *not* an error here; callers that want
    /// fail-on-nonzero semantics use [`exec_checked`](Self::exec_checked).
    pub async fn exec(&self) -> Result<ExecOutput, CommandError> {
        debug!("executing: {}", self.display());
        let mut cmd = self.build();
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let fut = cmd.output();
        let output = match self.timeout {
            Some(t) => tokio::time::timeout(t, fut).await.map_err(|_| {
                CommandError::Timeout {
                    command: self.display(),
                    timeout: t,
                }
            })?,
            None => fut.await,
        }
        .map_err(|e| CommandError::Spawn {
            command: self.display(),
            source: e,
        })?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Execute the command, failing with [`CommandError::Failed`] on a
    /// non-zero exit code. Returns stdout on success.
    pub async fn exec_checked(&self) -> Result<String, CommandError> {
        let output = self.exec().await?;
        if !output.success() {
            return Err(CommandError::Failed {
                command: self.display(),
                code: output.exit_code,
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    /// Spawn the command and return a [`LineStream`] over its stdout.
    pub fn stream(&self) -> Result<LineStream, CommandError> {
        debug!("streaming: {}", self.display());
        let mut cmd = self.build();
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| CommandError::Spawn {
            command: self.display(),
            source: e,
        })?;
        let stdout = child
            .stdout
            .take()
            .expect("child stdout requested as piped");

        Ok(LineStream {
            command: self.display(),
            child,
            lines: BufReader::new(stdout).lines(),
            unresponsive_timeout: None,
        })
    }
}

/// Line-by-line iterator over a running command's stdout.
///
/// Each [`next_line`](Self::next_line) call is a suspension point. The
/// underlying process is killed when the stream is dropped, whether the
/// consumer finished iterating, errored, or was cancelled.
pub struct LineStream {
    command: String,
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    unresponsive_timeout: Option<Duration>,
}

impl LineStream {
    /// Fail a line read that takes longer than `timeout`, treating the
    /// remote process as unresponsive.
    pub fn with_unresponsive_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.unresponsive_timeout = timeout;
        self
    }

    /// Read the next line of output, or `None` once the stream ends.
    pub async fn next_line(&mut self) -> Result<Option<String>, CommandError> {
        let read = self.lines.next_line();
        match self.unresponsive_timeout {
            Some(t) => tokio::time::timeout(t, read)
                .await
                .map_err(|_| CommandError::Timeout {
                    command: self.command.clone(),
                    timeout: t,
                })?
                .map_err(CommandError::from),
            None => read.await.map_err(CommandError::from),
        }
    }

    /// Wait for the process to finish, returning [`CommandError::Failed`]
    /// (with captured stderr) on a non-zero exit code.
    ///
    /// Callers should have drained the stream first; any remaining output
    /// is discarded.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<(), CommandError> {
        let start = Instant::now();
        let status = match timeout {
            Some(t) => tokio::time::timeout(t, self.child.wait())
                .await
                .map_err(|_| CommandError::Timeout {
                    command: self.command.clone(),
                    timeout: t,
                })??,
            None => self.child.wait().await?,
        };
        debug!(
            "process '{}' exited with {:?} after {:?}",
            self.command,
            status.code(),
            start.elapsed()
        );
        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = self.child.stderr.take() {
                pipe.read_to_string(&mut stderr).await.ok();
            }
            return Err(CommandError::Failed {
                command: self.command.clone(),
                code: status.code().unwrap_or(-1),
                message: stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Terminate the process. `force` skips the graceful attempt.
    pub async fn stop(&mut self, force: bool) {
        if force {
            self.child.kill().await.ok();
        } else {
            self.child.start_kill().ok();
            self.child.wait().await.ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(args: &[&str]) -> AdbCommand {
        // Tests drive the bridge with /bin/sh standing in for adb.
        AdbCommand::new("/bin/sh", None).args(args.iter().copied())
    }

    #[tokio::test]
    async fn exec_captures_stdout_and_exit_code() {
        let out = sh(&["-c", "echo hello; exit 0"]).exec().await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn exec_checked_fails_on_nonzero_exit() {
        let err = sh(&["-c", "echo oops >&2; exit 3"])
            .exec_checked()
            .await
            .unwrap_err();
        match err {
            CommandError::Failed { code, message, .. } => {
                assert_eq!(code, 3);
                assert!(message.contains("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn exec_times_out() {
        let err = sh(&["-c", "sleep 5"])
            .timeout(Some(Duration::from_millis(50)))
            .exec()
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
    }

    #[tokio::test]
    async fn stream_yields_lines_in_order() {
        let mut stream = sh(&["-c", "printf 'a\\nb\\nc\\n'"]).stream().unwrap();
        let mut seen = Vec::new();
        while let Some(line) = stream.next_line().await.unwrap() {
            seen.push(line);
        }
        assert_eq!(seen, vec!["a", "b", "c"]);
        stream.wait(Some(Duration::from_secs(5))).await.unwrap();
    }

    #[tokio::test]
    async fn stream_wait_reports_failure_with_stderr() {
        let mut stream = sh(&["-c", "echo bad >&2; exit 2"]).stream().unwrap();
        while stream.next_line().await.unwrap().is_some() {}
        let err = stream.wait(Some(Duration::from_secs(5))).await.unwrap_err();
        match err {
            CommandError::Failed { code, message, .. } => {
                assert_eq!(code, 2);
                assert!(message.contains("bad"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unresponsive_stream_times_out_per_line() {
        let mut stream = sh(&["-c", "echo first; sleep 5; echo second"])
            .stream()
            .unwrap()
            .with_unresponsive_timeout(Some(Duration::from_millis(100)));
        assert_eq!(stream.next_line().await.unwrap().unwrap(), "first");
        let err = stream.next_line().await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
        stream.stop(true).await;
    }
}
