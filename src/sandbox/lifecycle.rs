//! Sandbox lifecycle management.
//!
//! `SandboxManager` drives each instance through
//! `NotStarted → Provisioning → Ready ⇄ Executing → TearingDown → Destroyed`,
//! with `Errored` reachable from bring-up, a timed-out command, or a failed
//! destroy. It is the only writer of instance state.
//!
//! # Ordering
//!
//! Configuration is fully checked (definition present, topology resolved)
//! before anything is spawned or registered. A definition that computes its
//! machine names is the exception: those are read with `vagrant status` in
//! the materialized workspace, which boots nothing, before the gate is
//! taken. Only `vagrant up` takes a startup-gate ticket; commands and file
//! transfers never wait on it. Teardown waits for in-flight commands to
//! finish and does not preempt them.
//!
//! # Cancellation
//!
//! Dropping a `provision` or `teardown` future part-way leaves the instance
//! `Errored` rather than stuck mid-transition, so a later teardown or sweep
//! can still reclaim it. The gate ticket is released on drop and the running
//! `vagrant` process is killed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::exec::{ExecOutput, ExecRequest, shell_quote};
use super::registry::{EnvironmentRegistry, SandboxId, SandboxInfo, SandboxInstance};
use super::{ManagerConfig, SandboxConfig, SandboxState};
use crate::driver::status::parse_machine_status;
use crate::driver::{Invocation, MachineStatus, VagrantCli, VagrantDriver, is_already_absent};
use crate::error::{ConfigError, DriverError, Result, SandboxError, WorkspaceError};
use crate::gate::StartupGate;
use crate::topology::{Topology, declared_machines, has_computed_names, resolve};
use crate::workspace::{
    WorkspaceMetadata, WorkspacePaths, ensure_cache_root, materialize, workspace_name,
};

/// How a teardown request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Machines destroyed (or already absent) and the workspace released.
    Destroyed { machines: Vec<String> },
    /// Nothing registered under this id; nothing to do.
    AlreadyDestroyed,
}

/// How to reach a running sandbox by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxConnection {
    /// Always `"vagrant"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Shell command that opens a session on the primary machine.
    pub command: String,
    /// Directory the command must be run from.
    pub working_dir: PathBuf,
    pub machine: String,
}

/// Context object for one harness run.
///
/// Cheap to clone; clones share the driver, gate and registry.
#[derive(Clone)]
pub struct SandboxManager {
    config: Arc<ManagerConfig>,
    driver: Arc<dyn VagrantDriver>,
    gate: Arc<StartupGate>,
    registry: Arc<EnvironmentRegistry>,
}

impl fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxManager")
            .field("config", &self.config)
            .field("gate", &self.gate)
            .field("instances", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl SandboxManager {
    /// Creates a manager driving the real `vagrant` binary.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidStartupLimit` if `max_startups` is zero.
    pub fn new(config: ManagerConfig) -> std::result::Result<Self, ConfigError> {
        let driver = VagrantCli::new().with_program(config.vagrant_program.clone());
        Self::with_driver(config, Arc::new(driver))
    }

    /// Creates a manager with a custom driver.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidStartupLimit` if `max_startups` is zero.
    pub fn with_driver(
        config: ManagerConfig,
        driver: Arc<dyn VagrantDriver>,
    ) -> std::result::Result<Self, ConfigError> {
        let gate = StartupGate::new(config.max_startups)?;
        Ok(Self {
            config: Arc::new(config),
            driver,
            gate: Arc::new(gate),
            registry: Arc::new(EnvironmentRegistry::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<StartupGate> {
        &self.gate
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn VagrantDriver> {
        &self.driver
    }

    /// Provisions a sandbox for one sample and brings its machines up.
    ///
    /// # Errors
    ///
    /// * `ConfigError` for invalid options, a missing definition, or an
    ///   ambiguous/unknown primary. Nothing is spawned or registered.
    /// * `SandboxError::AlreadyExists` if `id` is registered.
    /// * `SandboxError::ProvisioningFailed` / `ProvisioningTimedOut` if
    ///   bring-up fails. The instance stays registered as `Errored` for
    ///   teardown or a sweep.
    ///
    /// For a definition with computed machine names, a failed `vagrant
    /// status` or an unresolvable primary unregisters the instance and
    /// removes its workspace before the error is returned.
    #[instrument(skip(self, id, config), fields(id = tracing::field::Empty))]
    pub async fn provision(
        &self,
        id: impl Into<SandboxId>,
        sample_id: &str,
        config: &SandboxConfig,
    ) -> Result<Sandbox> {
        let id = id.into();
        tracing::Span::current().record("id", tracing::field::display(&id));

        config.validate()?;
        let definition = resolve_definition(&config.vagrantfile_path)?;
        let text = std::fs::read_to_string(&definition).map_err(|e| WorkspaceError::IoError {
            context: format!("failed to read {}", definition.display()),
            source: e,
        })?;
        let requested = config.primary_vm_name.as_deref();
        let static_topology = if has_computed_names(&text) {
            debug!("definition computes machine names, asking vagrant once materialized");
            None
        } else {
            let topology = resolve(&declared_machines(&text), requested)?;
            debug!(
                primary = topology.primary(),
                machines = ?topology.machines(),
                "topology resolved"
            );
            Some(topology)
        };

        if self.registry.get(&id).is_some() {
            return Err(SandboxError::AlreadyExists { id: id.to_string() }.into());
        }

        let paths = WorkspacePaths::new(&self.config.cache_root, &workspace_name(sample_id));
        let mut metadata = WorkspaceMetadata::new(id.as_str(), sample_id, &definition);
        if let Some(topology) = &static_topology {
            metadata = metadata.with_topology(topology.machines().to_vec(), topology.primary());
        }
        let discover = static_topology.is_none();
        let instance = Arc::new(SandboxInstance::new(
            id.clone(),
            sample_id,
            paths.clone(),
            static_topology.unwrap_or_else(Topology::pending),
            config.vagrantfile_env_vars.clone(),
            metadata.clone(),
        ));
        self.registry.insert(Arc::clone(&instance))?;
        instance.transition(SandboxState::Provisioning)?;
        let cancelled = ErrorOnDrop::new(&instance, "provision");

        let materialized = ensure_cache_root(&self.config.cache_root)
            .and_then(|()| materialize(&definition, &paths, &metadata));
        if let Err(e) = materialized {
            warn!(%id, error = %e, "failed to materialize workspace");
            instance.transition(SandboxState::Errored)?;
            return Err(e.into());
        }
        instance.persist_metadata();
        debug!(%id, workspace = %paths.root.display(), "workspace ready");

        if discover {
            if let Err(e) = self.discover_topology(&instance, requested).await {
                warn!(%id, error = %e, "could not resolve machines, dropping sandbox");
                cancelled.disarm();
                self.abandon(&instance);
                return Err(e);
            }
        }

        let ticket = match self.gate.acquire().await {
            Ok(ticket) => ticket,
            Err(e) => {
                instance.transition(SandboxState::Errored)?;
                return Err(e.into());
            }
        };

        info!(%id, "bringing up sandbox");
        let inv = Invocation::new(&paths.root, instance.env())
            .with_timeout(self.config.bring_up_timeout);
        let result = self.driver.up(inv).await;
        ticket.release();

        match result {
            Ok(r) if r.success() => {
                instance.transition(SandboxState::Ready)?;
                info!(%id, elapsed_ms = %r.duration.as_millis(), "sandbox ready");
                Ok(Sandbox::new(self.clone(), id))
            }
            Ok(r) => {
                instance.transition(SandboxState::Errored)?;
                warn!(%id, exit_code = r.exit_code, "vagrant up failed");
                Err(SandboxError::ProvisioningFailed {
                    id: id.to_string(),
                    exit_code: r.exit_code,
                    stderr: r.stderr_lossy().trim().to_string(),
                }
                .into())
            }
            Err(DriverError::Timeout { timeout, .. }) => {
                instance.transition(SandboxState::Errored)?;
                warn!(%id, "vagrant up timed out");
                Err(SandboxError::ProvisioningTimedOut {
                    id: id.to_string(),
                    timeout,
                }
                .into())
            }
            Err(e) => {
                instance.transition(SandboxState::Errored)?;
                warn!(%id, error = %e, "vagrant up could not be run");
                Err(e.into())
            }
        }
    }

    /// Reads the machine names of a definition that computes them, with
    /// `vagrant status` in the materialized workspace.
    async fn discover_topology(
        &self,
        instance: &SandboxInstance,
        requested: Option<&str>,
    ) -> Result<()> {
        let inv = Invocation::new(&instance.workspace().root, instance.env())
            .with_timeout(self.config.bring_up_timeout);
        let r = self.driver.status(inv).await?;
        if !r.success() {
            return Err(SandboxError::ProvisioningFailed {
                id: instance.id().to_string(),
                exit_code: r.exit_code,
                stderr: r.stderr_lossy().trim().to_string(),
            }
            .into());
        }

        let names: Vec<String> = parse_machine_status(&r.stdout_lossy())
            .into_iter()
            .map(|m| m.name)
            .collect();
        let topology = resolve(&names, requested)?;
        debug!(
            primary = topology.primary(),
            machines = ?topology.machines(),
            "topology reported by vagrant"
        );
        instance.set_topology(topology);
        Ok(())
    }

    /// Unregisters an instance that never booted and removes its workspace.
    fn abandon(&self, instance: &SandboxInstance) {
        self.registry.remove(instance.id());
        if let Err(e) = instance.workspace().cleanup() {
            warn!(id = %instance.id(), error = %e, "failed to remove workspace, leaving it for cleanup");
        }
    }

    /// Returns a handle for a registered sandbox.
    #[must_use]
    pub fn sandbox(&self, id: impl Into<SandboxId>) -> Option<Sandbox> {
        let id = id.into();
        self.registry
            .get(&id)
            .map(|_| Sandbox::new(self.clone(), id))
    }

    fn instance(&self, id: &SandboxId) -> std::result::Result<Arc<SandboxInstance>, SandboxError> {
        self.registry
            .get(id)
            .ok_or_else(|| SandboxError::NotFound { id: id.to_string() })
    }

    fn target_machine(
        instance: &SandboxInstance,
        requested: Option<&str>,
    ) -> std::result::Result<String, ConfigError> {
        let topology = instance.topology();
        match requested {
            None => Ok(topology.primary().to_string()),
            Some(m) if topology.contains(m) => Ok(m.to_string()),
            Some(m) => Err(ConfigError::UnknownMachine {
                machine: m.to_string(),
                machines: topology.machines().join(", "),
            }),
        }
    }

    /// Runs a command in the guest.
    ///
    /// A non-zero exit is returned as data. The startup gate is not used.
    ///
    /// # Errors
    ///
    /// * `SandboxError::InvalidState` unless the instance is ready.
    /// * `SandboxError::CommandTimedOut` if the request's timeout elapses; the
    ///   instance becomes `Errored` and the guest command may keep running.
    #[instrument(
        skip(self, request),
        fields(%id, argv0 = request.argv.first().map(String::as_str))
    )]
    pub async fn exec(&self, id: &SandboxId, request: ExecRequest) -> Result<ExecOutput> {
        request.validate()?;
        let instance = self.instance(id)?;
        let machine = Self::target_machine(&instance, request.machine.as_deref())?;
        let machine: &str = &machine;
        let _guard = instance.begin_operation("exec")?;

        let command = request.remote_command();
        debug!(machine, command = %command, "exec");
        let inv = Invocation::new(&instance.workspace().root, instance.env())
            .with_timeout(request.timeout);

        match self
            .driver
            .ssh(inv, machine, &command, request.input.as_deref())
            .await
        {
            Ok(result) => {
                debug!(
                    exit_code = result.exit_code,
                    elapsed_ms = %result.duration.as_millis(),
                    "exec completed"
                );
                Ok(ExecOutput::from(result))
            }
            Err(DriverError::Timeout { timeout, .. }) => {
                warn!(%id, machine, "command timed out, marking sandbox errored");
                mark_errored(&instance);
                Err(SandboxError::CommandTimedOut {
                    id: id.to_string(),
                    timeout,
                }
                .into())
            }
            Err(e) => {
                if matches!(e, DriverError::Unrecoverable { .. }) {
                    mark_errored(&instance);
                }
                Err(e.into())
            }
        }
    }

    /// Copies `contents` to `path` in the guest.
    ///
    /// The bytes are staged in the workspace, the parent directory is created
    /// over ssh, then `vagrant upload` copies the file in.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::FileTransfer` if any step fails.
    #[instrument(skip(self, contents), fields(%id, len = contents.len()))]
    pub async fn write_file(
        &self,
        id: &SandboxId,
        machine: Option<&str>,
        path: &str,
        contents: &[u8],
    ) -> Result<()> {
        let instance = self.instance(id)?;
        let machine = Self::target_machine(&instance, machine)?;
        let machine: &str = &machine;
        let _guard = instance.begin_operation("write_file")?;

        let workspace = instance.workspace();
        let staging = workspace.uploads.join(Uuid::new_v4().simple().to_string());
        tokio::fs::write(&staging, contents)
            .await
            .map_err(|e| WorkspaceError::IoError {
                context: format!("failed to stage upload: {}", staging.display()),
                source: e,
            })?;

        let result = self
            .upload_staged(&instance, machine, &staging, path)
            .await;

        if let Err(e) = tokio::fs::remove_file(&staging).await {
            debug!(error = %e, staging = %staging.display(), "failed to remove staged upload");
        }
        result
    }

    async fn upload_staged(
        &self,
        instance: &SandboxInstance,
        machine: &str,
        staging: &Path,
        path: &str,
    ) -> Result<()> {
        let inv = Invocation::new(&instance.workspace().root, instance.env());
        let transfer_err = |reason: String| SandboxError::FileTransfer {
            path: path.to_string(),
            reason,
        };

        if let Some(parent) = Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty() && p != "/")
        {
            let mkdir = format!("mkdir -p -- {}", shell_quote(&parent));
            let r = self.driver.ssh(inv, machine, &mkdir, None).await?;
            if !r.success() {
                return Err(transfer_err(r.stderr_lossy().trim().to_string()).into());
            }
        }

        let r = self.driver.upload(inv, machine, staging, path).await?;
        if !r.success() {
            return Err(transfer_err(r.stderr_lossy().trim().to_string()).into());
        }
        debug!(machine, path, "file uploaded");
        Ok(())
    }

    /// Reads `path` from the guest.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::FileTransfer` if the file cannot be read.
    #[instrument(skip(self), fields(%id))]
    pub async fn read_file(
        &self,
        id: &SandboxId,
        machine: Option<&str>,
        path: &str,
    ) -> Result<Vec<u8>> {
        let instance = self.instance(id)?;
        let machine = Self::target_machine(&instance, machine)?;
        let machine: &str = &machine;
        let _guard = instance.begin_operation("read_file")?;

        let inv = Invocation::new(&instance.workspace().root, instance.env());
        let command = format!("cat -- {}", shell_quote(path));
        let r = self.driver.ssh(inv, machine, &command, None).await?;
        if !r.success() {
            return Err(SandboxError::FileTransfer {
                path: path.to_string(),
                reason: r.stderr_lossy().trim().to_string(),
            }
            .into());
        }
        Ok(r.stdout)
    }

    /// Reads `path` from the guest as UTF-8 text.
    ///
    /// # Errors
    ///
    /// As [`SandboxManager::read_file`], plus `SandboxError::OutputEncoding`
    /// for non-UTF-8 content.
    pub async fn read_file_text(
        &self,
        id: &SandboxId,
        machine: Option<&str>,
        path: &str,
    ) -> Result<String> {
        let bytes = self.read_file(id, machine, path).await?;
        String::from_utf8(bytes).map_err(|e| {
            SandboxError::OutputEncoding {
                context: format!("{path}: {e}"),
            }
            .into()
        })
    }

    /// Vagrant's view of the instance's machines.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::InvalidState` unless the instance is ready, or a
    /// driver error if `vagrant status` cannot run.
    #[instrument(skip(self), fields(%id))]
    pub async fn status(&self, id: &SandboxId) -> Result<Vec<MachineStatus>> {
        let instance = self.instance(id)?;
        let _guard = instance.begin_operation("status")?;
        let inv = Invocation::new(&instance.workspace().root, instance.env());
        let r = self.driver.status(inv).await?;
        Ok(parse_machine_status(&r.stdout_lossy()))
    }

    /// Connection details for the primary (or given) machine.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::InvalidState` unless the instance is ready.
    pub fn connection(&self, id: &SandboxId, machine: Option<&str>) -> Result<SandboxConnection> {
        let instance = self.instance(id)?;
        let machine = Self::target_machine(&instance, machine)?;
        let machine: &str = &machine;
        let state = instance.state();
        if !state.accepts_operations() {
            return Err(SandboxError::InvalidState {
                id: id.to_string(),
                state: state.to_string(),
                operation: "connect",
            }
            .into());
        }
        Ok(SandboxConnection {
            kind: "vagrant".to_string(),
            command: format!("vagrant ssh {}", shell_quote(machine)),
            working_dir: instance.workspace().root.clone(),
            machine: machine.to_string(),
        })
    }

    #[must_use]
    pub fn info(&self, id: &SandboxId) -> Option<SandboxInfo> {
        self.registry.get(id).map(|i| i.info())
    }

    /// Snapshot of all registered instances, ordered by id.
    #[must_use]
    pub fn list(&self) -> Vec<SandboxInfo> {
        self.registry.snapshot().iter().map(|i| i.info()).collect()
    }

    /// Destroys every machine of the instance and releases its workspace.
    ///
    /// Waits for in-flight commands first. An id that is not registered
    /// (never provisioned, or already torn down) is a successful no-op.
    ///
    /// # Errors
    ///
    /// * `SandboxError::InvalidState` while provisioning or already tearing down.
    /// * `SandboxError::TeardownFailed` if a destroy fails for a reason other
    ///   than "already absent". The instance and workspace are kept as
    ///   `Errored` so a later sweep can retry.
    #[instrument(skip(self), fields(%id))]
    pub async fn teardown(&self, id: &SandboxId) -> Result<TeardownOutcome> {
        let Some(instance) = self.registry.get(id) else {
            debug!("not registered, nothing to tear down");
            return Ok(TeardownOutcome::AlreadyDestroyed);
        };

        {
            let drain = instance.drain().await?;
            instance.transition(SandboxState::TearingDown)?;
            drop(drain);
        }
        let _cancelled = ErrorOnDrop::new(&instance, "teardown");
        info!(%id, "tearing down sandbox");

        match self.destroy_machines(&instance).await {
            Ok(()) => {
                instance.transition(SandboxState::Destroyed)?;
                if let Err(e) = instance.workspace().cleanup() {
                    warn!(%id, error = %e, "failed to remove workspace, leaving it for cleanup");
                }
                self.registry.remove(id);
                info!(%id, "sandbox destroyed");
                Ok(TeardownOutcome::Destroyed {
                    machines: instance.topology().machines().to_vec(),
                })
            }
            Err(reason) => {
                instance.transition(SandboxState::Errored)?;
                warn!(%id, %reason, "teardown failed");
                Err(SandboxError::TeardownFailed {
                    id: id.to_string(),
                    reason,
                }
                .into())
            }
        }
    }

    async fn destroy_machines(
        &self,
        instance: &SandboxInstance,
    ) -> std::result::Result<(), String> {
        let workspace = instance.workspace();
        if !workspace.exists() {
            debug!(id = %instance.id(), "workspace missing, nothing to destroy");
            return Ok(());
        }

        let inv = Invocation::new(&workspace.root, instance.env())
            .with_timeout(self.config.teardown_timeout);
        let failures = destroy_each(self.driver.as_ref(), inv, &instance.topology()).await;
        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }

    /// Harness hook called when a sample finishes.
    ///
    /// Interrupted samples are left in place so they can be inspected;
    /// `vagrant-sandbox cleanup` reclaims them later.
    ///
    /// # Errors
    ///
    /// As [`SandboxManager::teardown`].
    pub async fn cleanup_sample(
        &self,
        id: &SandboxId,
        interrupted: bool,
    ) -> Result<Option<TeardownOutcome>> {
        if interrupted {
            if let Some(info) = self.info(id) {
                info!(
                    %id,
                    workspace = %info.workspace.display(),
                    "sample interrupted, leaving sandbox in place; run `vagrant-sandbox cleanup` to remove it"
                );
            }
            return Ok(None);
        }
        self.teardown(id).await.map(Some)
    }
}

/// Runs `destroy -f <machine>` for every machine, collecting failures.
/// A topology with no machines yet destroys the whole environment.
/// "Already absent" counts as success.
pub(crate) async fn destroy_each(
    driver: &dyn VagrantDriver,
    inv: Invocation<'_>,
    topology: &Topology,
) -> Vec<String> {
    let targets: Vec<Option<&str>> = if topology.machines().is_empty() {
        vec![None]
    } else {
        topology.machines().iter().map(|m| Some(m.as_str())).collect()
    };

    let mut failures = Vec::new();
    for target in targets {
        let machine = target.unwrap_or("environment");
        match driver.destroy(inv, target).await {
            Ok(r) if r.success() => debug!(machine = %machine, "machine destroyed"),
            Ok(r) if is_already_absent(&r.stdout_lossy(), &r.stderr_lossy()) => {
                debug!(machine = %machine, "machine already absent");
            }
            Ok(r) => failures.push(format!(
                "{machine}: exit code {}: {}",
                r.exit_code,
                r.stderr_lossy().trim()
            )),
            Err(e) => failures.push(format!("{machine}: {e}")),
        }
    }
    failures
}

/// Moves an instance left `Provisioning` or `TearingDown` to `Errored` when
/// the future driving it is dropped.
struct ErrorOnDrop {
    instance: Arc<SandboxInstance>,
    operation: &'static str,
    armed: bool,
}

impl ErrorOnDrop {
    fn new(instance: &Arc<SandboxInstance>, operation: &'static str) -> Self {
        Self {
            instance: Arc::clone(instance),
            operation,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ErrorOnDrop {
    fn drop(&mut self) {
        if self.armed && self.instance.state().is_transitional() {
            warn!(
                id = %self.instance.id(),
                operation = self.operation,
                "cancelled mid-transition, marking sandbox errored"
            );
            mark_errored(&self.instance);
        }
    }
}

fn mark_errored(instance: &SandboxInstance) {
    if let Err(e) = instance.transition(SandboxState::Errored) {
        debug!(id = %instance.id(), error = %e, "instance already left the executing state");
    }
}

fn resolve_definition(path: &Path) -> std::result::Result<PathBuf, ConfigError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    if absolute.is_file() {
        Ok(absolute)
    } else {
        Err(ConfigError::DefinitionNotFound { path: absolute })
    }
}

/// Handle to one provisioned sandbox.
#[derive(Debug, Clone)]
pub struct Sandbox {
    manager: SandboxManager,
    id: SandboxId,
    machine: Option<String>,
}

impl Sandbox {
    fn new(manager: SandboxManager, id: SandboxId) -> Self {
        Self {
            manager,
            id,
            machine: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    /// A handle whose commands and file transfers target `machine`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownMachine` if `machine` is not declared.
    pub fn on_machine(&self, machine: &str) -> Result<Self> {
        let instance = self.manager.instance(&self.id)?;
        SandboxManager::target_machine(&instance, Some(machine))?;
        Ok(Self {
            machine: Some(machine.to_string()),
            ..self.clone()
        })
    }

    /// The machine this handle targets.
    #[must_use]
    pub fn machine(&self) -> Option<String> {
        self.machine
            .clone()
            .or_else(|| self.manager.info(&self.id).map(|i| i.primary))
    }

    #[must_use]
    pub fn primary(&self) -> Option<String> {
        self.manager.info(&self.id).map(|i| i.primary)
    }

    #[must_use]
    pub fn machines(&self) -> Vec<String> {
        self.manager
            .info(&self.id)
            .map(|i| i.machines)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn workspace(&self) -> Option<PathBuf> {
        self.manager.info(&self.id).map(|i| i.workspace)
    }

    #[must_use]
    pub fn state(&self) -> Option<SandboxState> {
        self.manager.info(&self.id).map(|i| i.state)
    }

    /// Runs a command; see [`SandboxManager::exec`].
    ///
    /// # Errors
    ///
    /// As [`SandboxManager::exec`].
    pub async fn exec(&self, mut request: ExecRequest) -> Result<ExecOutput> {
        if request.machine.is_none() {
            request.machine.clone_from(&self.machine);
        }
        self.manager.exec(&self.id, request).await
    }

    /// # Errors
    ///
    /// As [`SandboxManager::write_file`].
    pub async fn write_file(&self, path: &str, contents: impl AsRef<[u8]>) -> Result<()> {
        self.manager
            .write_file(&self.id, self.machine.as_deref(), path, contents.as_ref())
            .await
    }

    /// # Errors
    ///
    /// As [`SandboxManager::read_file`].
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.manager
            .read_file(&self.id, self.machine.as_deref(), path)
            .await
    }

    /// # Errors
    ///
    /// As [`SandboxManager::read_file_text`].
    pub async fn read_file_text(&self, path: &str) -> Result<String> {
        self.manager
            .read_file_text(&self.id, self.machine.as_deref(), path)
            .await
    }

    /// # Errors
    ///
    /// As [`SandboxManager::status`].
    pub async fn status(&self) -> Result<Vec<MachineStatus>> {
        self.manager.status(&self.id).await
    }

    /// # Errors
    ///
    /// As [`SandboxManager::connection`].
    pub fn connection(&self) -> Result<SandboxConnection> {
        self.manager.connection(&self.id, self.machine.as_deref())
    }

    /// # Errors
    ///
    /// As [`SandboxManager::teardown`].
    pub async fn teardown(&self) -> Result<TeardownOutcome> {
        self.manager.teardown(&self.id).await
    }
}
