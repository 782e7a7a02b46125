//! Vagrant Sandbox - per-sample Vagrant VM sandboxes for evaluation harnesses.
//!
//! Each sample gets its own workspace (a private copy of the VM definition
//! directory) under a shared cache root, its own set of machines, and a
//! handle for running commands and moving files in and out of the guest.
//!
//! - Concurrent `vagrant up` calls are bounded by a [`StartupGate`].
//! - Commands, uploads and downloads go through the `vagrant` CLI, behind
//!   the [`VagrantDriver`] trait.
//! - Teardown is idempotent; [`SandboxManager::sweep`] reconciles errored
//!   instances and workspaces orphaned by crashed runs.
//!
//! # Host Requirements
//!
//! - `vagrant` on `PATH` with a working provider
//! - A writable cache root (default `~/.cache/inspect-vagrant-sandbox/`)
//!
//! # Example
//!
//! ```no_run
//! use vagrant_sandbox::{ExecRequest, ManagerConfig, SandboxConfig, SandboxManager, system};
//!
//! #[tokio::main]
//! async fn main() -> miette::Result<()> {
//!     let config = ManagerConfig::from_env()?;
//!     system::check_all(&config.vagrant_program, &config.cache_root)?;
//!
//!     let manager = SandboxManager::new(config)?;
//!     let sandbox = manager
//!         .provision("sample-1", "sample-1", &SandboxConfig::default())
//!         .await?;
//!
//!     let output = sandbox.exec(ExecRequest::new(["whoami"])).await?;
//!     println!("{}", output.stdout.trim());
//!
//!     sandbox.teardown().await?;
//!     Ok(())
//! }
//! ```

pub mod driver;
pub mod error;
pub mod gate;
pub mod sandbox;
pub mod sweep;
pub mod system;
pub mod topology;
pub mod workspace;

// Re-export commonly used types
pub use driver::{VagrantCli, VagrantDriver};
pub use error::{Error, Result};
pub use gate::StartupGate;
pub use sandbox::{
    ExecOutput, ExecRequest, ManagerConfig, Sandbox, SandboxConfig, SandboxId, SandboxManager,
    SandboxState, TeardownOutcome,
};
pub use sweep::CleanupReport;
