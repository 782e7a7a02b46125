//! Error types for vagrant-sandbox.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//!
//! Configuration problems are reported before any external process is spawned.
//! A non-zero exit from a command inside the guest is *not* an error: it is
//! returned as data in [`crate::sandbox::ExecOutput`].

use std::path::PathBuf;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the crate.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Invalid sandbox or manager configuration
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    /// Workspace creation or removal failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Workspace(#[from] WorkspaceError),

    /// The external tool could not be driven
    #[error(transparent)]
    #[diagnostic(transparent)]
    Driver(#[from] DriverError),

    /// Lifecycle failure for a specific sandbox
    #[error(transparent)]
    #[diagnostic(transparent)]
    Sandbox(#[from] SandboxError),

    /// Host pre-flight check failed
    #[error("System requirements check failed")]
    #[diagnostic(code(vsb::system::requirements))]
    SystemRequirements(#[from] SystemRequirementsError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(vsb::io))]
    Io(#[from] std::io::Error),
}

/// Configuration errors. Never retried; raised before any process spawns.
#[derive(Error, Debug, Diagnostic)]
pub enum ConfigError {
    /// Several machines declared but no primary chosen
    #[error("definition declares multiple machines ({machines}) but primary_vm_name is not set")]
    #[diagnostic(
        code(vsb::config::ambiguous_primary),
        help("Set primary_vm_name to one of the declared machine names")
    )]
    AmbiguousPrimary { machines: String },

    /// Requested primary is not declared in the definition
    #[error("primary_vm_name '{requested}' is not declared in the definition (declared: {machines})")]
    #[diagnostic(code(vsb::config::unknown_primary))]
    UnknownPrimary { requested: String, machines: String },

    /// A command targeted a machine that is not part of the topology
    #[error("machine '{machine}' is not part of this sandbox (machines: {machines})")]
    #[diagnostic(code(vsb::config::unknown_machine))]
    UnknownMachine { machine: String, machines: String },

    /// Topology resolution received no machine names
    #[error("definition declares no machines")]
    #[diagnostic(code(vsb::config::no_machines))]
    NoMachines,

    /// The VM definition file does not exist
    #[error("vagrantfile_path does not exist or is not a file: {}", path.display())]
    #[diagnostic(
        code(vsb::config::definition_not_found),
        help("Relative paths are resolved against the current working directory")
    )]
    DefinitionNotFound { path: PathBuf },

    /// A recognised option has an invalid value
    #[error("invalid value for {option}: {reason}")]
    #[diagnostic(code(vsb::config::invalid_option))]
    InvalidOption { option: &'static str, reason: String },

    /// Unknown field or type mismatch while deserializing
    #[error("malformed sandbox configuration: {reason}")]
    #[diagnostic(
        code(vsb::config::malformed),
        help("Recognised options: vagrantfile_path, vagrantfile_env_vars, primary_vm_name")
    )]
    Malformed { reason: String },

    /// Bad startup concurrency limit
    #[error("INSPECT_MAX_VAGRANT_STARTUPS must be a positive integer, got '{value}'")]
    #[diagnostic(code(vsb::config::startup_limit))]
    InvalidStartupLimit { value: String },
}

/// Errors related to workspace materialization and storage.
#[derive(Error, Debug, Diagnostic)]
pub enum WorkspaceError {
    /// Source definition missing at materialization time
    #[error("VM definition not found: {}", path.display())]
    #[diagnostic(code(vsb::workspace::definition_not_found))]
    DefinitionNotFound { path: PathBuf },

    /// Workspace is malformed
    #[error("invalid workspace: {reason}")]
    #[diagnostic(code(vsb::workspace::invalid))]
    InvalidWorkspace { reason: String },

    /// I/O error with context
    #[error("workspace I/O error: {context}")]
    #[diagnostic(code(vsb::workspace::io))]
    IoError {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while running the external tool.
#[derive(Error, Debug, Diagnostic)]
pub enum DriverError {
    /// The tool binary could not be started
    #[error("failed to spawn '{program}'")]
    #[diagnostic(
        code(vsb::driver::spawn),
        help("Is Vagrant installed and on PATH?")
    )]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The invocation exceeded its timeout; the tool process was terminated
    #[error("vagrant {operation} timed out after {}ms", timeout.as_millis())]
    #[diagnostic(code(vsb::driver::timeout))]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The tool process survived SIGTERM and SIGKILL
    #[error("vagrant {operation} timed out and could not be terminated")]
    #[diagnostic(
        code(vsb::driver::unrecoverable),
        help("The process may still be running; inspect it manually")
    )]
    Unrecoverable { operation: &'static str },

    /// Zero timeouts are rejected
    #[error("timeout must be positive")]
    #[diagnostic(code(vsb::driver::invalid_timeout))]
    InvalidTimeout,

    /// I/O error while talking to the child
    #[error("driver I/O error: {context}")]
    #[diagnostic(code(vsb::driver::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Lifecycle errors for a single sandbox instance.
#[derive(Error, Debug, Diagnostic)]
pub enum SandboxError {
    /// No instance registered under this id
    #[error("sandbox not found: {id}")]
    #[diagnostic(code(vsb::sandbox::not_found))]
    NotFound { id: String },

    /// An instance with this id is already registered
    #[error("sandbox already exists: {id}")]
    #[diagnostic(code(vsb::sandbox::already_exists))]
    AlreadyExists { id: String },

    /// Operation not permitted in the current lifecycle state
    #[error("sandbox {id} cannot {operation} while {state}")]
    #[diagnostic(code(vsb::sandbox::invalid_state))]
    InvalidState {
        id: String,
        state: String,
        operation: &'static str,
    },

    /// Bring-up exited non-zero
    #[error("vagrant up failed for sandbox {id} (exit code {exit_code}): {stderr}")]
    #[diagnostic(
        code(vsb::sandbox::provisioning_failed),
        help("The instance is left Errored; run `vagrant-sandbox cleanup` to reclaim it")
    )]
    ProvisioningFailed {
        id: String,
        exit_code: i32,
        stderr: String,
    },

    /// Bring-up did not finish in time
    #[error("vagrant up for sandbox {id} timed out after {}s", timeout.as_secs())]
    #[diagnostic(code(vsb::sandbox::provisioning_timeout))]
    ProvisioningTimedOut { id: String, timeout: Duration },

    /// A guest command did not finish in time
    #[error("command in sandbox {id} timed out after {}s", timeout.as_secs())]
    #[diagnostic(
        code(vsb::sandbox::command_timeout),
        help("The command may still be running inside the guest")
    )]
    CommandTimedOut { id: String, timeout: Duration },

    /// Destroy failed; the instance remains for the sweeper
    #[error("teardown failed for sandbox {id}: {reason}")]
    #[diagnostic(
        code(vsb::sandbox::teardown_failed),
        help("Run `vagrant-sandbox cleanup` to retry")
    )]
    TeardownFailed { id: String, reason: String },

    /// File copy in or out failed
    #[error("file transfer failed for {path}: {reason}")]
    #[diagnostic(code(vsb::sandbox::file_transfer))]
    FileTransfer { path: String, reason: String },

    /// Output is not valid UTF-8
    #[error("output encoding error: {context}")]
    #[diagnostic(code(vsb::sandbox::output_encoding))]
    OutputEncoding { context: String },

    /// The startup gate was closed
    #[error("startup gate closed")]
    #[diagnostic(code(vsb::sandbox::gate_closed))]
    GateClosed,
}

/// Errors related to host pre-flight checks.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemRequirementsError {
    /// The vagrant binary could not be run
    #[error("'{program}' is not available")]
    #[diagnostic(
        code(vsb::system::vagrant_missing),
        help("Install Vagrant from https://developer.hashicorp.com/vagrant/install")
    )]
    VagrantUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// `vagrant --version` produced something unexpected
    #[error("could not parse vagrant version from: {output}")]
    #[diagnostic(code(vsb::system::vagrant_version))]
    UnparsableVersion { output: String },

    /// The cache root is not usable
    #[error("cache root is not writable: {}", path.display())]
    #[diagnostic(code(vsb::system::cache_root))]
    CacheRootUnwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_names_offending_option() {
        let err = ConfigError::AmbiguousPrimary {
            machines: "a, b".to_string(),
        };
        assert!(err.to_string().contains("primary_vm_name"));

        let err = ConfigError::InvalidOption {
            option: "vagrantfile_env_vars",
            reason: "empty key".to_string(),
        };
        assert!(err.to_string().contains("vagrantfile_env_vars"));
    }

    #[test]
    fn test_top_level_is_transparent() {
        let err: Error = SandboxError::NotFound {
            id: "s1".to_string(),
        }
        .into();
        assert_eq!(err.to_string(), "sandbox not found: s1");
    }
}
