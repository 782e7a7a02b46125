//! Environment registry and per-instance state.
//!
//! The registry maps sandbox ids to live instances. Each instance guards its
//! lifecycle state with a small mutex; the lifecycle code in `lifecycle.rs`
//! is the only caller of [`SandboxInstance::transition`].
//!
//! Commands and file transfers hold an [`OperationGuard`] while in flight.
//! Teardown sets `draining`, which rejects new operations, then waits on a
//! `Notify` until the last guard drops.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{trace, warn};

use super::SandboxState;
use crate::error::SandboxError;
use crate::topology::Topology;
use crate::workspace::{WorkspaceMetadata, WorkspacePaths, canonical_path};

/// Opaque, harness-assigned sandbox identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SandboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SandboxId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SandboxId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for SandboxId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Point-in-time view of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxInfo {
    pub id: SandboxId,
    pub sample_id: String,
    pub state: SandboxState,
    pub primary: String,
    pub machines: Vec<String>,
    pub workspace: PathBuf,
    pub in_flight: usize,
}

#[derive(Debug)]
struct Inner {
    state: SandboxState,
    topology: Topology,
    in_flight: usize,
    draining: bool,
    metadata: WorkspaceMetadata,
}

/// A sandbox instance owned by the registry.
#[derive(Debug)]
pub struct SandboxInstance {
    id: SandboxId,
    sample_id: String,
    workspace: WorkspacePaths,
    env: BTreeMap<String, String>,
    inner: Mutex<Inner>,
    drained: Notify,
}

impl SandboxInstance {
    /// Creates an instance in `NotStarted`.
    #[must_use]
    pub fn new(
        id: SandboxId,
        sample_id: impl Into<String>,
        workspace: WorkspacePaths,
        topology: Topology,
        env: BTreeMap<String, String>,
        metadata: WorkspaceMetadata,
    ) -> Self {
        Self {
            id,
            sample_id: sample_id.into(),
            workspace,
            env,
            inner: Mutex::new(Inner {
                state: SandboxState::NotStarted,
                topology,
                in_flight: 0,
                draining: false,
                metadata,
            }),
            drained: Notify::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    #[must_use]
    pub fn sample_id(&self) -> &str {
        &self.sample_id
    }

    #[must_use]
    pub fn workspace(&self) -> &WorkspacePaths {
        &self.workspace
    }

    /// Resolved machines. Empty while provisioning has not discovered them.
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.lock().topology.clone()
    }

    /// Replaces the topology once vagrant has reported the machines.
    pub(crate) fn set_topology(&self, topology: Topology) {
        let mut inner = self.lock();
        inner.metadata.machines = topology.machines().to_vec();
        inner.metadata.primary = Some(topology.primary().to_string());
        inner.topology = topology;
        Self::persist(&self.workspace, &mut inner);
    }

    /// Environment overrides for this instance's vagrant invocations.
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    #[must_use]
    pub fn state(&self) -> SandboxState {
        self.lock().state
    }

    /// Operations currently holding a guard.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    #[must_use]
    pub fn info(&self) -> SandboxInfo {
        let inner = self.lock();
        SandboxInfo {
            id: self.id.clone(),
            sample_id: self.sample_id.clone(),
            state: inner.state,
            primary: inner.topology.primary().to_string(),
            machines: inner.topology.machines().to_vec(),
            workspace: self.workspace.root.clone(),
            in_flight: inner.in_flight,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn invalid(&self, state: SandboxState, operation: &'static str) -> SandboxError {
        SandboxError::InvalidState {
            id: self.id.to_string(),
            state: state.to_string(),
            operation,
        }
    }

    /// Moves to `next`, persisting the new state to the workspace metadata.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::InvalidState` if the edge is not allowed.
    pub fn transition(&self, next: SandboxState) -> Result<(), SandboxError> {
        let mut inner = self.lock();
        if !inner.state.can_transition_to(next) {
            return Err(self.invalid(inner.state, "transition"));
        }
        trace!(id = %self.id, from = %inner.state, to = %next, "state transition");
        inner.state = next;
        Self::persist(&self.workspace, &mut inner);
        Ok(())
    }

    /// Writes the current state to the workspace metadata file, if the
    /// workspace exists yet.
    pub(crate) fn persist_metadata(&self) {
        let mut inner = self.lock();
        Self::persist(&self.workspace, &mut inner);
    }

    fn persist(workspace: &WorkspacePaths, inner: &mut Inner) {
        let state = inner.state;
        inner.metadata.set_state(state);
        if workspace.exists() {
            if let Err(e) = inner.metadata.save(&workspace.meta_file) {
                warn!(error = %e, "failed to persist workspace metadata");
            }
        }
    }

    /// Registers an in-flight command or file transfer.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::InvalidState` unless the instance is `Ready` or
    /// `Executing` with no teardown pending.
    pub fn begin_operation(
        self: &Arc<Self>,
        operation: &'static str,
    ) -> Result<OperationGuard, SandboxError> {
        let mut inner = self.lock();
        if inner.draining || !inner.state.accepts_operations() {
            let state = inner.state;
            return Err(self.invalid(state, operation));
        }
        if inner.state == SandboxState::Ready {
            inner.state = SandboxState::Executing;
            Self::persist(&self.workspace, &mut inner);
        }
        inner.in_flight += 1;
        Ok(OperationGuard {
            instance: Arc::clone(self),
        })
    }

    fn end_operation(&self) {
        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if inner.in_flight == 0 {
            if inner.state == SandboxState::Executing {
                inner.state = SandboxState::Ready;
                Self::persist(&self.workspace, &mut inner);
            }
            self.drained.notify_waiters();
        }
    }

    /// Rejects new operations and waits for in-flight ones to finish.
    ///
    /// Returns a guard that keeps the instance draining; dropping it without
    /// moving to `TearingDown` reopens the instance.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::InvalidState` if the instance cannot be torn
    /// down from its current state or another teardown is already waiting.
    pub async fn drain(&self) -> Result<DrainGuard<'_>, SandboxError> {
        {
            let mut inner = self.lock();
            let teardown_allowed = matches!(
                inner.state,
                SandboxState::Ready | SandboxState::Executing | SandboxState::Errored
            );
            if inner.draining || !teardown_allowed {
                let state = inner.state;
                return Err(self.invalid(state, "teardown"));
            }
            inner.draining = true;
        }
        let guard = DrainGuard { instance: self };

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let in_flight = self.lock().in_flight;
            if in_flight == 0 {
                break;
            }
            trace!(id = %self.id, in_flight, "waiting for operations to drain");
            notified.await;
        }

        Ok(guard)
    }
}

/// Keeps an instance in its executing sub-state while held.
#[derive(Debug)]
#[must_use = "the operation ends when the guard is dropped"]
pub struct OperationGuard {
    instance: Arc<SandboxInstance>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.instance.end_operation();
    }
}

/// Held by teardown between draining and the next state change.
#[derive(Debug)]
pub struct DrainGuard<'a> {
    instance: &'a SandboxInstance,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.instance.lock().draining = false;
    }
}

/// Table of live sandbox instances for one harness run.
#[derive(Debug, Default)]
pub struct EnvironmentRegistry {
    instances: RwLock<HashMap<SandboxId, Arc<SandboxInstance>>>,
}

impl EnvironmentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an instance.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::AlreadyExists` if the id is taken.
    pub fn insert(&self, instance: Arc<SandboxInstance>) -> Result<(), SandboxError> {
        let mut map = self.instances.write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(instance.id()) {
            return Err(SandboxError::AlreadyExists {
                id: instance.id().to_string(),
            });
        }
        map.insert(instance.id().clone(), instance);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, id: &SandboxId) -> Option<Arc<SandboxInstance>> {
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &SandboxId) -> Option<Arc<SandboxInstance>> {
        self.instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    /// All instances, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<SandboxInstance>> {
        let mut all: Vec<_> = self
            .instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// Returns `true` if a live instance uses `root` as its workspace.
    ///
    /// Paths are compared after resolving symlinks, so a directory reported
    /// by vagrant matches an instance created under a symlinked cache root.
    #[must_use]
    pub fn owns_workspace(&self, root: &Path) -> bool {
        let canonical = canonical_path(root);
        self.instances
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|i| {
                let own = &i.workspace().root;
                own == root || canonical_path(own) == canonical
            })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::resolve;
    use std::time::Duration;

    fn instance(id: &str) -> Arc<SandboxInstance> {
        let topology = resolve(&["default".to_string()], None).expect("topology");
        let paths = WorkspacePaths::new(Path::new("/nonexistent/cache"), id);
        Arc::new(SandboxInstance::new(
            SandboxId::from(id),
            "sample",
            paths,
            topology,
            BTreeMap::new(),
            WorkspaceMetadata::new(id, "sample", "Vagrantfile"),
        ))
    }

    fn ready(id: &str) -> Arc<SandboxInstance> {
        let inst = instance(id);
        inst.transition(SandboxState::Provisioning).expect("provisioning");
        inst.transition(SandboxState::Ready).expect("ready");
        inst
    }

    #[test]
    fn test_transition_rejects_illegal_edge() {
        let inst = instance("a");
        let err = inst.transition(SandboxState::Ready).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState { .. }));
        assert_eq!(inst.state(), SandboxState::NotStarted);
    }

    #[test]
    fn test_operation_rejected_while_provisioning() {
        let inst = instance("a");
        inst.transition(SandboxState::Provisioning).expect("provisioning");
        assert!(inst.begin_operation("exec").is_err());
    }

    #[test]
    fn test_operation_guards_toggle_executing() {
        let inst = ready("a");

        let g1 = inst.begin_operation("exec").expect("first");
        let g2 = inst.begin_operation("exec").expect("second");
        assert_eq!(inst.state(), SandboxState::Executing);
        assert_eq!(inst.in_flight(), 2);

        drop(g1);
        assert_eq!(inst.state(), SandboxState::Executing);
        drop(g2);
        assert_eq!(inst.state(), SandboxState::Ready);
        assert_eq!(inst.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_operations() {
        let inst = ready("a");
        let guard = inst.begin_operation("exec").expect("op");

        let drainer = {
            let inst = Arc::clone(&inst);
            tokio::spawn(async move {
                let _drain = inst.drain().await.expect("drain");
                inst.transition(SandboxState::TearingDown).expect("tearing down");
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drainer.is_finished());
        assert!(inst.begin_operation("exec").is_err(), "draining rejects new ops");

        drop(guard);
        drainer.await.expect("join");
        assert_eq!(inst.state(), SandboxState::TearingDown);
    }

    #[tokio::test]
    async fn test_drain_guard_reopens_on_drop() {
        let inst = ready("a");
        drop(inst.drain().await.expect("drain"));
        assert!(inst.begin_operation("exec").is_ok());
    }

    #[test]
    fn test_registry_insert_get_remove() {
        let registry = EnvironmentRegistry::new();
        registry.insert(instance("b")).expect("insert b");
        registry.insert(instance("a")).expect("insert a");
        assert!(matches!(
            registry.insert(instance("a")),
            Err(SandboxError::AlreadyExists { .. })
        ));

        let ids: Vec<_> = registry.snapshot().iter().map(|i| i.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(registry.owns_workspace(Path::new("/nonexistent/cache/a")));

        assert!(registry.remove(&SandboxId::from("a")).is_some());
        assert!(registry.get(&SandboxId::from("a")).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_owns_workspace_through_symlink() {
        let real = tempfile::tempdir().expect("tempdir");
        let links = tempfile::tempdir().expect("tempdir");
        let cache = links.path().join("cache");
        std::os::unix::fs::symlink(real.path(), &cache).expect("symlink");

        let paths = WorkspacePaths::new(&cache, "ws");
        std::fs::create_dir(&paths.root).expect("mkdir");
        let registry = EnvironmentRegistry::new();
        registry
            .insert(Arc::new(SandboxInstance::new(
                SandboxId::from("a"),
                "sample",
                paths,
                resolve(&["default".to_string()], None).expect("topology"),
                BTreeMap::new(),
                WorkspaceMetadata::new("a", "sample", "Vagrantfile"),
            )))
            .expect("insert");

        let resolved = std::fs::canonicalize(real.path().join("ws")).expect("canonicalize");
        assert!(registry.owns_workspace(&resolved));
        assert!(registry.owns_workspace(&cache.join("ws")));
        assert!(!registry.owns_workspace(&real.path().join("other")));
    }

    #[test]
    fn test_set_topology_updates_info() {
        let inst = instance("a");
        let topology = resolve(&["web".to_string(), "db".to_string()], Some("db"))
            .expect("topology");
        inst.set_topology(topology);

        let info = inst.info();
        assert_eq!(info.primary, "db");
        assert_eq!(info.machines, vec!["web", "db"]);
    }
}
