//! Sandbox lifecycle: provisioning, commands, file transfer and teardown.
//!
//! A [`SandboxManager`] owns everything shared across samples for one
//! harness run: the driver, the startup gate and the registry of live
//! instances. Each provisioned sample gets a [`Sandbox`] handle.
//!
//! # Example
//!
//! ```no_run
//! use vagrant_sandbox::sandbox::{ExecRequest, ManagerConfig, SandboxConfig, SandboxManager};
//!
//! # async fn run() -> vagrant_sandbox::Result<()> {
//! let manager = SandboxManager::new(ManagerConfig::from_env()?)?;
//!
//! let config = SandboxConfig::default().with_vagrantfile_path("Vagrantfile");
//! let sandbox = manager.provision("sample-1", "sample-1", &config).await?;
//!
//! let output = sandbox.exec(ExecRequest::new(["uname", "-a"])).await?;
//! println!("{}", output.stdout);
//!
//! sandbox.teardown().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod exec;
mod lifecycle;
mod registry;
mod state;

pub use config::{DEFAULT_VAGRANTFILE, SandboxConfig};
pub use exec::{ExecOutput, ExecRequest, build_remote_command, shell_join, shell_quote};
pub use lifecycle::{Sandbox, SandboxConnection, SandboxManager, TeardownOutcome};
pub use registry::{
    DrainGuard, EnvironmentRegistry, OperationGuard, SandboxId, SandboxInfo, SandboxInstance,
};
pub use state::SandboxState;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::gate::default_startup_limit;
use crate::workspace::default_cache_root;

const DEFAULT_UNTRACKED_GRACE: Duration = Duration::from_secs(600);

/// Settings shared by every sandbox of one harness run.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use vagrant_sandbox::sandbox::ManagerConfig;
///
/// let config = ManagerConfig::default()
///     .with_cache_root("/tmp/vagrant-cache")
///     .with_max_startups(2)
///     .with_bring_up_timeout(Duration::from_secs(900));
/// assert_eq!(config.max_startups, 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Directory holding one workspace per sandbox.
    ///
    /// Defaults to `~/.cache/inspect-vagrant-sandbox/`.
    pub cache_root: PathBuf,

    /// Concurrent `vagrant up` limit.
    ///
    /// Defaults to the host logical-core count.
    pub max_startups: usize,

    /// Upper bound on `vagrant up`. Defaults to none.
    pub bring_up_timeout: Option<Duration>,

    /// Upper bound on each `vagrant destroy`. Defaults to none.
    pub teardown_timeout: Option<Duration>,

    /// Vagrant binary. Defaults to `vagrant` on `PATH`.
    pub vagrant_program: PathBuf,

    /// How long a sweep leaves a workspace without metadata alone, in case
    /// another process is still materializing it. Defaults to ten minutes.
    pub untracked_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            max_startups: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1),
            bring_up_timeout: None,
            teardown_timeout: None,
            vagrant_program: PathBuf::from("vagrant"),
            untracked_grace: DEFAULT_UNTRACKED_GRACE,
        }
    }
}

impl ManagerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults, with the startup limit taken from
    /// `INSPECT_MAX_VAGRANT_STARTUPS` when set.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidStartupLimit` for an invalid override.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            max_startups: default_startup_limit()?,
            ..Self::default()
        })
    }

    #[must_use]
    pub fn with_cache_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_root = path.into();
        self
    }

    #[must_use]
    pub fn with_max_startups(mut self, limit: usize) -> Self {
        self.max_startups = limit;
        self
    }

    #[must_use]
    pub fn with_bring_up_timeout(mut self, timeout: Duration) -> Self {
        self.bring_up_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_untracked_grace(mut self, grace: Duration) -> Self {
        self.untracked_grace = grace;
        self
    }

    #[must_use]
    pub fn with_vagrant_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.vagrant_program = program.into();
        self
    }
}
