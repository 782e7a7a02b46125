//! Best-effort cleanup of errored and orphaned sandboxes.
//!
//! Three passes, each tolerant of the previous one's failures:
//!
//! 1. **Registry**: `Errored` instances with nothing in flight are torn down.
//!    Instances that are ready, executing, provisioning or tearing down are
//!    left alone.
//! 2. **Disk**: workspaces under the cache root that no live instance owns,
//!    and whose recorded owner process is gone, get `vagrant destroy -f` and
//!    are then removed. A workspace without metadata is left alone until it
//!    is older than [`untracked_grace`](crate::sandbox::ManagerConfig::untracked_grace).
//! 3. **Machine index**: `vagrant global-status --prune` entries that still
//!    point under the cache root are destroyed by machine id.
//!
//! Paths are compared after resolving symlinks, since `global-status`
//! reports canonical directories.
//!
//! "Already absent" counts as success everywhere. The sweep itself never
//! fails; every target ends up in the [`CleanupReport`].

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::driver::status::parse_global_status;
use crate::driver::{Invocation, ProcessResult, is_already_absent};
use crate::error::DriverError;
use crate::sandbox::{SandboxId, SandboxManager, SandboxState, TeardownOutcome};
use crate::workspace::{WorkspaceMetadata, WorkspacePaths, canonical_path, list_workspaces};

/// What a cleanup outcome refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CleanupTarget {
    /// A registered sandbox instance.
    Instance { id: SandboxId },
    /// A workspace directory with no live owner.
    Workspace { path: PathBuf },
    /// A machine from vagrant's global index.
    Machine { id: String, directory: PathBuf },
    /// The `global-status` query itself.
    MachineIndex,
}

impl fmt::Display for CleanupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance { id } => write!(f, "sandbox {id}"),
            Self::Workspace { path } => write!(f, "workspace {}", path.display()),
            Self::Machine { id, directory } => {
                write!(f, "machine {id} ({})", directory.display())
            }
            Self::MachineIndex => write!(f, "vagrant global-status"),
        }
    }
}

/// Result for one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "lowercase")]
pub enum CleanupResult {
    Destroyed,
    AlreadyAbsent,
    Skipped(String),
    Failed(String),
}

impl CleanupResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Destroyed | Self::AlreadyAbsent)
    }
}

impl fmt::Display for CleanupResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Destroyed => write!(f, "destroyed"),
            Self::AlreadyAbsent => write!(f, "already absent"),
            Self::Skipped(reason) => write!(f, "skipped: {reason}"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupOutcome {
    pub target: CleanupTarget,
    pub result: CleanupResult,
}

/// Everything a sweep did, plus where to look for leftovers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub cache_root: PathBuf,
    pub outcomes: Vec<CleanupOutcome>,
}

impl CleanupReport {
    fn new(cache_root: PathBuf) -> Self {
        Self {
            cache_root,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, target: CleanupTarget, result: CleanupResult) {
        match &result {
            CleanupResult::Failed(reason) => warn!(%target, %reason, "cleanup failed"),
            other => debug!(%target, result = %other, "cleanup outcome"),
        }
        self.outcomes.push(CleanupOutcome { target, result });
    }

    /// Targets destroyed or found already absent.
    pub fn succeeded(&self) -> impl Iterator<Item = &CleanupOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &CleanupOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, CleanupResult::Failed(_)))
    }

    /// Returns `true` if no target failed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed().next().is_none()
    }
}

impl SandboxManager {
    /// Reconciles errored instances and orphaned workspaces and machines.
    ///
    /// Safe to run while other samples are provisioning or executing: only
    /// `Errored` instances and unowned workspaces are touched.
    #[instrument(skip(self), fields(cache_root = %self.config().cache_root.display()))]
    pub async fn sweep(&self) -> CleanupReport {
        let cache_root = self.config().cache_root.clone();
        let mut report = CleanupReport::new(cache_root.clone());

        self.sweep_registry(&mut report).await;
        let handled = self.sweep_workspaces(&cache_root, &mut report).await;
        self.sweep_machine_index(&cache_root, &handled, &mut report)
            .await;

        info!(
            targets = report.outcomes.len(),
            failed = report.failed().count(),
            "sweep complete"
        );
        report
    }

    async fn sweep_registry(&self, report: &mut CleanupReport) {
        for instance in self.registry().snapshot() {
            if instance.state() != SandboxState::Errored || instance.in_flight() > 0 {
                continue;
            }
            let id = instance.id().clone();
            debug!(%id, "tearing down errored instance");
            let result = match self.teardown(&id).await {
                Ok(TeardownOutcome::Destroyed { .. }) => CleanupResult::Destroyed,
                Ok(TeardownOutcome::AlreadyDestroyed) => CleanupResult::AlreadyAbsent,
                Err(e) => CleanupResult::Failed(e.to_string()),
            };
            report.record(CleanupTarget::Instance { id }, result);
        }
    }

    /// Returns the canonical workspace directories this pass handled or
    /// deliberately left to a live owner.
    async fn sweep_workspaces(
        &self,
        cache_root: &Path,
        report: &mut CleanupReport,
    ) -> HashSet<PathBuf> {
        let mut handled = HashSet::new();
        let env = BTreeMap::new();

        for dir in list_workspaces(cache_root) {
            // Resolved up front; a removed directory no longer canonicalizes.
            let canonical = canonical_path(&dir);
            if self.registry().owns_workspace(&dir) {
                handled.insert(canonical);
                continue;
            }

            let paths = WorkspacePaths::from_root(dir.clone());
            match WorkspaceMetadata::load(&paths.meta_file) {
                Ok(meta) => {
                    if !meta.is_owned_by_current_process() && process_alive(meta.owner_pid) {
                        report.record(
                            CleanupTarget::Workspace { path: dir.clone() },
                            CleanupResult::Skipped(format!(
                                "owned by running process {}",
                                meta.owner_pid
                            )),
                        );
                        handled.insert(canonical);
                        continue;
                    }
                }
                Err(_) if younger_than(&dir, self.config().untracked_grace) => {
                    report.record(
                        CleanupTarget::Workspace { path: dir.clone() },
                        CleanupResult::Skipped("no metadata yet, may still be materializing".into()),
                    );
                    handled.insert(canonical);
                    continue;
                }
                Err(e) => debug!(workspace = %dir.display(), error = %e, "workspace has no metadata"),
            }

            debug!(workspace = %dir.display(), "destroying orphaned workspace");
            let inv =
                Invocation::new(&dir, &env).with_timeout(self.config().teardown_timeout);
            let mut result = classify(self.driver().destroy(inv, None).await);
            if result.is_success() {
                if let Err(e) = paths.cleanup() {
                    result = CleanupResult::Failed(format!("machines destroyed but {e}"));
                }
            }
            report.record(CleanupTarget::Workspace { path: dir.clone() }, result);
            handled.insert(canonical);
        }

        handled
    }

    async fn sweep_machine_index(
        &self,
        cache_root: &Path,
        handled: &HashSet<PathBuf>,
        report: &mut CleanupReport,
    ) {
        let env = BTreeMap::new();
        let working_dir = if cache_root.is_dir() {
            cache_root.to_path_buf()
        } else {
            std::env::temp_dir()
        };
        let inv =
            Invocation::new(&working_dir, &env).with_timeout(self.config().teardown_timeout);

        let entries = match self.driver().global_status(inv, true).await {
            Ok(r) if r.success() => parse_global_status(&r.stdout_lossy()),
            Ok(r) => {
                report.record(
                    CleanupTarget::MachineIndex,
                    CleanupResult::Failed(format!(
                        "exit code {}: {}",
                        r.exit_code,
                        r.stderr_lossy().trim()
                    )),
                );
                return;
            }
            Err(e) => {
                report.record(
                    CleanupTarget::MachineIndex,
                    CleanupResult::Failed(e.to_string()),
                );
                return;
            }
        };

        let canonical_root = canonical_path(cache_root);
        for entry in entries {
            let under_root = entry.directory.starts_with(cache_root)
                || entry.directory.starts_with(&canonical_root);
            if !under_root
                || handled.contains(&canonical_path(&entry.directory))
                || self.registry().owns_workspace(&entry.directory)
            {
                continue;
            }

            debug!(
                machine = %entry.id,
                directory = %entry.directory.display(),
                "destroying indexed machine"
            );
            let result = classify(self.driver().destroy(inv, Some(&entry.id)).await);
            report.record(
                CleanupTarget::Machine {
                    id: entry.id,
                    directory: entry.directory,
                },
                result,
            );
        }
    }
}

/// Returns `true` if `dir` was modified less than `grace` ago. An unreadable
/// or future mtime counts as young.
fn younger_than(dir: &Path, grace: std::time::Duration) -> bool {
    let Ok(modified) = std::fs::metadata(dir).and_then(|m| m.modified()) else {
        return true;
    };
    !SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|age| age >= grace)
}

fn classify(result: Result<ProcessResult, DriverError>) -> CleanupResult {
    match result {
        Ok(r) if r.success() => CleanupResult::Destroyed,
        Ok(r) if is_already_absent(&r.stdout_lossy(), &r.stderr_lossy()) => {
            CleanupResult::AlreadyAbsent
        }
        Ok(r) => CleanupResult::Failed(format!(
            "exit code {}: {}",
            r.exit_code,
            r.stderr_lossy().trim()
        )),
        Err(e) => CleanupResult::Failed(e.to_string()),
    }
}

/// Checks whether `pid` is a running process (signal 0).
fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(code: i32, stderr: &str) -> Result<ProcessResult, DriverError> {
        Ok(ProcessResult {
            exit_code: code,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            duration: Duration::ZERO,
        })
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(result(0, "")), CleanupResult::Destroyed);
        assert_eq!(
            classify(result(1, "VM not created. Moving on...")),
            CleanupResult::AlreadyAbsent
        );
        assert!(matches!(
            classify(result(1, "locked")),
            CleanupResult::Failed(r) if r.contains("locked")
        ));
        assert!(matches!(
            classify(Err(DriverError::InvalidTimeout)),
            CleanupResult::Failed(_)
        ));
    }

    #[test]
    fn test_process_alive() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(u32::MAX));
    }

    #[test]
    fn test_report_counts() {
        let mut report = CleanupReport::new(PathBuf::from("/cache"));
        report.record(CleanupTarget::MachineIndex, CleanupResult::Destroyed);
        assert!(report.is_clean());
        report.record(
            CleanupTarget::Workspace { path: "/cache/a".into() },
            CleanupResult::Failed("busy".into()),
        );
        assert_eq!(report.succeeded().count(), 1);
        assert_eq!(report.failed().count(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_report_serializes() {
        let mut report = CleanupReport::new(PathBuf::from("/cache"));
        report.record(
            CleanupTarget::Instance { id: "s1".into() },
            CleanupResult::Skipped("busy".into()),
        );
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["outcomes"][0]["target"]["kind"], "instance");
        assert_eq!(json["outcomes"][0]["result"]["result"], "skipped");
    }
}
