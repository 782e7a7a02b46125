//! `VagrantCli`: runs the real `vagrant` binary through tokio.
//!
//! # Notes on stdio and timeouts
//!
//! stdin is `/dev/null` unless the caller supplies input. An inherited stdin
//! makes `vagrant ssh` wait on the terminal and hang commands such as `cat`.
//!
//! stdout/stderr are drained on separate tasks while the child runs, so a
//! chatty `vagrant up` cannot fill a pipe and deadlock.
//!
//! On timeout the tool process gets SIGTERM, then SIGKILL after a grace
//! period. A caller that drops the future kills it outright. The VM it was
//! driving is not touched; that is left to teardown and the sweeper.
//!
//! A failed pipe read is reported as `DriverError::Io` rather than as empty
//! output.

use std::ffi::OsString;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use super::{Invocation, ProcessResult, VagrantDriver};
use crate::error::DriverError;

/// How long a timed-out process gets after each signal before escalating.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// Drives the `vagrant` command-line tool.
#[derive(Debug, Clone)]
pub struct VagrantCli {
    program: PathBuf,
    kill_grace: Duration,
}

impl Default for VagrantCli {
    fn default() -> Self {
        Self {
            program: PathBuf::from("vagrant"),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl VagrantCli {
    /// Creates a driver for `vagrant` on `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a different binary (an absolute path, or a name on `PATH`).
    #[must_use]
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Sets the grace period between SIGTERM and SIGKILL.
    #[must_use]
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Returns the binary this driver invokes.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    #[instrument(
        skip(self, args, inv, input),
        fields(cwd = %inv.working_dir.display(), timeout_ms = ?inv.timeout.map(|t| t.as_millis()))
    )]
    async fn run(
        &self,
        operation: &'static str,
        args: Vec<OsString>,
        inv: Invocation<'_>,
        input: Option<&[u8]>,
    ) -> Result<ProcessResult, DriverError> {
        if inv.timeout.is_some_and(|t| t.is_zero()) {
            return Err(DriverError::InvalidTimeout);
        }

        debug!(
            "executing: {} {}",
            self.program.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .current_dir(inv.working_dir)
            .envs(inv.env)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        let stdout_task = tokio::spawn(read_to_end(child.stdout.take()));
        let stderr_task = tokio::spawn(read_to_end(child.stderr.take()));

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            let data = data.to_vec();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&data).await {
                    trace!(error = %e, "stdin closed before input was fully written");
                }
                // Dropping stdin closes the pipe so the remote command sees EOF.
            });
        }

        let status = match inv.timeout {
            None => wait(&mut child).await?,
            Some(limit) => match tokio::time::timeout(limit, wait(&mut child)).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!(
                        operation,
                        timeout_ms = %limit.as_millis(),
                        "vagrant command timed out, terminating"
                    );
                    let terminated = self.terminate(&mut child, operation).await;
                    stdout_task.abort();
                    stderr_task.abort();
                    terminated?;
                    return Err(DriverError::Timeout {
                        operation,
                        timeout: limit,
                    });
                }
            },
        };

        let stdout = collect(stdout_task, "stdout").await?;
        let stderr = collect(stderr_task, "stderr").await?;

        let result = ProcessResult {
            exit_code: exit_code(status),
            stdout,
            stderr,
            duration: start.elapsed(),
        };

        if !result.stdout.is_empty() {
            debug!("vagrant stdout: {}", result.stdout_lossy().trim());
        }
        if !result.stderr.is_empty() {
            if result.success() {
                debug!("vagrant stderr: {}", result.stderr_lossy().trim());
            } else {
                info!("vagrant stderr: {}", result.stderr_lossy().trim());
            }
        }
        debug!(
            operation,
            exit_code = result.exit_code,
            elapsed_ms = %result.duration.as_millis(),
            "vagrant command completed"
        );

        Ok(result)
    }

    /// SIGTERM, wait, SIGKILL, wait. Errors if the process is still alive.
    async fn terminate(
        &self,
        child: &mut Child,
        operation: &'static str,
    ) -> Result<(), DriverError> {
        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                debug!(pid, error = %e, "SIGTERM failed");
            }
            if tokio::time::timeout(self.kill_grace, child.wait()).await.is_ok() {
                return Ok(());
            }
        }

        if let Err(e) = child.start_kill() {
            debug!(error = %e, "SIGKILL failed");
        }
        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(_) => Ok(()),
            Err(_) => Err(DriverError::Unrecoverable { operation }),
        }
    }
}

async fn wait(child: &mut Child) -> Result<ExitStatus, DriverError> {
    child.wait().await.map_err(|source| DriverError::Io {
        context: "failed to wait for vagrant".to_string(),
        source,
    })
}

async fn read_to_end<R: AsyncRead + Unpin>(reader: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut r) = reader {
        r.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

async fn collect(
    task: JoinHandle<io::Result<Vec<u8>>>,
    stream: &'static str,
) -> Result<Vec<u8>, DriverError> {
    let source = match task.await {
        Ok(Ok(buf)) => return Ok(buf),
        Ok(Err(e)) => e,
        Err(e) => io::Error::other(e),
    };
    Err(DriverError::Io {
        context: format!("failed to read vagrant {stream}"),
        source,
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

fn args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items.into_iter().map(Into::into).collect()
}

#[async_trait]
impl VagrantDriver for VagrantCli {
    async fn up(&self, inv: Invocation<'_>) -> Result<ProcessResult, DriverError> {
        self.run("up", args(["up"]), inv, None).await
    }

    async fn ssh(
        &self,
        inv: Invocation<'_>,
        machine: &str,
        command: &str,
        input: Option<&[u8]>,
    ) -> Result<ProcessResult, DriverError> {
        self.run("ssh", args(["ssh", machine, "--command", command]), inv, input)
            .await
    }

    async fn upload(
        &self,
        inv: Invocation<'_>,
        machine: &str,
        source: &Path,
        destination: &str,
    ) -> Result<ProcessResult, DriverError> {
        let argv = vec![
            OsString::from("upload"),
            source.as_os_str().to_os_string(),
            OsString::from(destination),
            OsString::from(machine),
        ];
        self.run("upload", argv, inv, None).await
    }

    async fn destroy(
        &self,
        inv: Invocation<'_>,
        target: Option<&str>,
    ) -> Result<ProcessResult, DriverError> {
        let mut argv = args(["destroy", "-f"]);
        argv.extend(target.map(OsString::from));
        self.run("destroy", argv, inv, None).await
    }

    async fn status(&self, inv: Invocation<'_>) -> Result<ProcessResult, DriverError> {
        self.run("status", args(["status", "--machine-readable"]), inv, None)
            .await
    }

    async fn global_status(
        &self,
        inv: Invocation<'_>,
        prune: bool,
    ) -> Result<ProcessResult, DriverError> {
        let mut argv = args(["global-status"]);
        if prune {
            argv.push(OsString::from("--prune"));
        }
        self.run("global-status", argv, inv, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_program() {
        let cli = VagrantCli::new();
        assert_eq!(cli.program(), Path::new("vagrant"));
        assert_eq!(cli.kill_grace, DEFAULT_KILL_GRACE);
    }

    #[test]
    fn test_exit_code_from_status() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        // Killed by SIGKILL (9).
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }

    #[tokio::test]
    async fn test_zero_timeout_rejected_before_spawn() {
        let cli = VagrantCli::new().with_program("/nonexistent/vagrant");
        let env = std::collections::BTreeMap::new();
        let inv = Invocation::new(Path::new("/"), &env).with_timeout(Some(Duration::ZERO));
        let err = cli.status(inv).await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidTimeout));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let cli = VagrantCli::new().with_program("/nonexistent/vagrant");
        let env = std::collections::BTreeMap::new();
        let err = cli.up(Invocation::new(Path::new("/"), &env)).await.unwrap_err();
        assert!(matches!(err, DriverError::Spawn { .. }));
    }

    struct BrokenPipe;

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Err(io::Error::other("pipe went away")))
        }
    }

    #[tokio::test]
    async fn test_read_error_is_reported() {
        let task = tokio::spawn(read_to_end(Some(BrokenPipe)));
        let err = collect(task, "stdout").await.unwrap_err();
        match err {
            DriverError::Io { context, source } => {
                assert_eq!(context, "failed to read vagrant stdout");
                assert_eq!(source.to_string(), "pipe went away");
            }
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_to_end_collects_output() {
        let task = tokio::spawn(read_to_end(Some(&b"Bringing machine up"[..])));
        assert_eq!(collect(task, "stdout").await.unwrap(), b"Bringing machine up");

        let none: Option<&[u8]> = None;
        let task = tokio::spawn(read_to_end(none));
        assert!(collect(task, "stderr").await.unwrap().is_empty());
    }
}
