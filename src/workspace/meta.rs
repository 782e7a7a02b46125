//! Workspace metadata, persisted to disk for orphan correlation.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkspaceError;
use crate::sandbox::SandboxState;

/// Metadata for a workspace, persisted as JSON next to the Vagrantfile.
///
/// Lets the sweeper and the `list` command tell which sample and which
/// process a directory on disk belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceMetadata {
    /// Harness-assigned sandbox identity.
    pub sandbox_id: String,

    /// Sample the sandbox was provisioned for.
    pub sample_id: String,

    /// Source definition the workspace was copied from.
    pub definition: PathBuf,

    /// Declared machines, in definition order.
    #[serde(default)]
    pub machines: Vec<String>,

    /// Primary machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// PID of the process that owns this workspace.
    pub owner_pid: u32,

    /// Last lifecycle state recorded for the instance.
    pub state: SandboxState,
}

impl WorkspaceMetadata {
    /// Creates metadata owned by the current process, in `NotStarted`.
    #[must_use]
    pub fn new(
        sandbox_id: impl Into<String>,
        sample_id: impl Into<String>,
        definition: impl Into<PathBuf>,
    ) -> Self {
        let now = Utc::now();
        Self {
            sandbox_id: sandbox_id.into(),
            sample_id: sample_id.into(),
            definition: definition.into(),
            machines: Vec::new(),
            primary: None,
            created_at: now,
            updated_at: now,
            owner_pid: std::process::id(),
            state: SandboxState::NotStarted,
        }
    }

    /// Records the resolved topology.
    #[must_use]
    pub fn with_topology(mut self, machines: Vec<String>, primary: impl Into<String>) -> Self {
        self.machines = machines;
        self.primary = Some(primary.into());
        self
    }

    /// Loads metadata from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if reading fails, or
    /// `WorkspaceError::InvalidWorkspace` if the JSON is malformed.
    pub fn load(path: &Path) -> Result<Self, WorkspaceError> {
        let content = fs::read_to_string(path).map_err(|e| WorkspaceError::IoError {
            context: format!("failed to read metadata file: {}", path.display()),
            source: e,
        })?;

        serde_json::from_str(&content).map_err(|e| WorkspaceError::InvalidWorkspace {
            reason: format!("failed to parse metadata JSON: {}", e),
        })
    }

    /// Saves metadata atomically (temp file, fsync, rename).
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if writing fails.
    pub fn save(&self, path: &Path) -> Result<(), WorkspaceError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| WorkspaceError::IoError {
            context: format!("failed to serialize metadata: {}", e),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        let temp_path = path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).map_err(|e| WorkspaceError::IoError {
            context: format!(
                "failed to create temp metadata file: {}",
                temp_path.display()
            ),
            source: e,
        })?;

        file.write_all(json.as_bytes())
            .map_err(|e| WorkspaceError::IoError {
                context: format!("failed to write metadata: {}", temp_path.display()),
                source: e,
            })?;

        file.sync_all().map_err(|e| WorkspaceError::IoError {
            context: "failed to sync metadata file".to_string(),
            source: e,
        })?;

        fs::rename(&temp_path, path).map_err(|e| WorkspaceError::IoError {
            context: format!(
                "failed to rename temp file {} to {}",
                temp_path.display(),
                path.display()
            ),
            source: e,
        })?;

        Ok(())
    }

    /// Updates the recorded state and timestamp.
    pub fn set_state(&mut self, state: SandboxState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Returns `true` if the owning process is this one.
    #[must_use]
    pub fn is_owned_by_current_process(&self) -> bool {
        self.owner_pid == std::process::id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metadata_new() {
        let meta = WorkspaceMetadata::new("sb-1", "sample-1", "/defs/Vagrantfile");

        assert_eq!(meta.sandbox_id, "sb-1");
        assert_eq!(meta.state, SandboxState::NotStarted);
        assert_eq!(meta.owner_pid, std::process::id());
        assert!(meta.is_owned_by_current_process());
        assert!(meta.primary.is_none());
    }

    #[test]
    fn test_metadata_save_load() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(".sandbox-meta.json");

        let mut meta = WorkspaceMetadata::new("sb-1", "sample-1", "/defs/Vagrantfile")
            .with_topology(vec!["attacker".into(), "victim".into()], "attacker");
        meta.set_state(SandboxState::Ready);

        meta.save(&path).expect("save");
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = WorkspaceMetadata::load(&path).expect("load");
        assert_eq!(loaded, meta);
        assert_eq!(loaded.primary.as_deref(), Some("attacker"));
    }

    #[test]
    fn test_metadata_load_malformed() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(".sandbox-meta.json");
        fs::write(&path, "{not json").expect("write");

        assert!(matches!(
            WorkspaceMetadata::load(&path),
            Err(WorkspaceError::InvalidWorkspace { .. })
        ));
    }

    #[test]
    fn test_state_serialized_lowercase() {
        let mut meta = WorkspaceMetadata::new("a", "b", "c");
        meta.set_state(SandboxState::TearingDown);
        let json = serde_json::to_string(&meta).expect("serialize");
        assert!(json.contains("\"state\":\"tearingdown\""), "{json}");
    }
}
