//! Process driver for the external `vagrant` tool.
//!
//! Every interaction with Vagrant goes through the [`VagrantDriver`] trait:
//! one method per verb, each taking the working directory, environment
//! overrides and timeout explicitly via [`Invocation`]. The driver runs the
//! process and reports what happened; it never decides whether an exit code
//! means success. That is the lifecycle layer's job.
//!
//! [`VagrantCli`] is the real implementation. Tests substitute a scripted
//! driver so the lifecycle can be exercised without spawning VMs.

mod process;
pub mod status;

pub use process::{DEFAULT_KILL_GRACE, VagrantCli};
pub use status::{GlobalStatusEntry, MachineStatus, is_already_absent};

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::DriverError;

/// Outcome of one external-tool invocation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessResult {
    /// Exit code; `128 + signal` when the process was killed by a signal.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// Wall-clock duration of the invocation.
    pub duration: Duration,
}

impl ProcessResult {
    /// Returns `true` if the process exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard output, lossily decoded.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error, lossily decoded.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Per-call execution context for the external tool.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// Directory the tool runs in (the workspace holding the Vagrantfile).
    pub working_dir: &'a Path,
    /// Extra environment for the tool process only.
    pub env: &'a BTreeMap<String, String>,
    /// Upper bound on the invocation; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl<'a> Invocation<'a> {
    /// Creates an invocation with no timeout.
    #[must_use]
    pub fn new(working_dir: &'a Path, env: &'a BTreeMap<String, String>) -> Self {
        Self {
            working_dir,
            env,
            timeout: None,
        }
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One operation per external-tool verb.
#[async_trait]
pub trait VagrantDriver: Send + Sync {
    /// Boots every machine in the definition (`vagrant up`).
    async fn up(&self, inv: Invocation<'_>) -> Result<ProcessResult, DriverError>;

    /// Runs a shell command on a machine (`vagrant ssh <machine> --command`).
    async fn ssh(
        &self,
        inv: Invocation<'_>,
        machine: &str,
        command: &str,
        input: Option<&[u8]>,
    ) -> Result<ProcessResult, DriverError>;

    /// Copies a host file into a machine (`vagrant upload`).
    async fn upload(
        &self,
        inv: Invocation<'_>,
        machine: &str,
        source: &Path,
        destination: &str,
    ) -> Result<ProcessResult, DriverError>;

    /// Destroys a machine, a global machine id, or (with `None`) every
    /// machine of the definition in the working directory.
    async fn destroy(
        &self,
        inv: Invocation<'_>,
        target: Option<&str>,
    ) -> Result<ProcessResult, DriverError>;

    /// Machine-readable status of the definition in the working directory.
    async fn status(&self, inv: Invocation<'_>) -> Result<ProcessResult, DriverError>;

    /// Host-wide machine index, optionally pruning stale entries.
    async fn global_status(
        &self,
        inv: Invocation<'_>,
        prune: bool,
    ) -> Result<ProcessResult, DriverError>;
}
