//! Per-sample workspaces.
//!
//! Each sandbox instance gets its own directory under the cache root holding
//! a private copy of the VM definition. Vagrant runs with that directory as
//! its working directory, so its `.vagrant/` state never leaks between
//! samples, even when they share a definition.
//!
//! # Storage Layout
//!
//! ```text
//! ~/.cache/inspect-vagrant-sandbox/
//! └── {sample-slug}-{token}/
//!     ├── Vagrantfile
//!     ├── .sandbox-meta.json
//!     ├── .sandbox-uploads/
//!     └── .vagrant/
//! ```
//!
//! # Example
//!
//! ```no_run
//! use vagrant_sandbox::workspace::{Workspace, default_cache_root};
//!
//! let ws = Workspace::materialize(&default_cache_root(), "Vagrantfile".as_ref(), "sample-1")?;
//! println!("workspace: {}", ws.root().display());
//! ws.remove()?;
//! # Ok::<(), vagrant_sandbox::error::WorkspaceError>(())
//! ```

mod materialize;
mod meta;
mod storage;

pub use materialize::materialize;
pub use meta::WorkspaceMetadata;
pub use storage::{
    CACHE_DIR_NAME, META_FILE, VAGRANTFILE, WorkspacePaths, canonical_path, default_cache_root,
    ensure_cache_root, list_workspaces, sanitize_name, workspace_name,
};
pub(crate) use storage::DIR_PERMISSIONS;

use std::path::Path;

use crate::error::WorkspaceError;

/// A materialized workspace: its paths plus the metadata written into it.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub paths: WorkspacePaths,
    pub metadata: WorkspaceMetadata,
}

impl Workspace {
    /// Materializes `definition` for `sample_id` in a fresh directory under
    /// `cache_root`.
    ///
    /// The sandbox id recorded in the metadata is the workspace name.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::DefinitionNotFound` or `WorkspaceError::IoError`.
    pub fn materialize(
        cache_root: &Path,
        definition: &Path,
        sample_id: &str,
    ) -> Result<Self, WorkspaceError> {
        let name = workspace_name(sample_id);
        let metadata = WorkspaceMetadata::new(name.as_str(), sample_id, definition);
        Self::create(cache_root, &name, definition, metadata)
    }

    /// Materializes into `cache_root/name` with caller-supplied metadata.
    ///
    /// # Errors
    ///
    /// Same as [`Workspace::materialize`].
    pub fn create(
        cache_root: &Path,
        name: &str,
        definition: &Path,
        metadata: WorkspaceMetadata,
    ) -> Result<Self, WorkspaceError> {
        ensure_cache_root(cache_root)?;
        let paths = WorkspacePaths::new(cache_root, name);
        materialize(definition, &paths, &metadata)?;
        Ok(Self { paths, metadata })
    }

    /// Opens an existing workspace directory.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::InvalidWorkspace` if the directory holds no
    /// definition or unreadable metadata.
    pub fn open(root: &Path) -> Result<Self, WorkspaceError> {
        let paths = WorkspacePaths::from_root(root.to_path_buf());
        paths.validate()?;
        let metadata = WorkspaceMetadata::load(&paths.meta_file)?;
        Ok(Self { paths, metadata })
    }

    /// Workspace root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    /// Persists the current metadata.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if writing fails.
    pub fn save_metadata(&self) -> Result<(), WorkspaceError> {
        self.metadata.save(&self.paths.meta_file)
    }

    /// Deletes the workspace directory.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if removal fails.
    pub fn remove(&self) -> Result<(), WorkspaceError> {
        self.paths.cleanup()
    }
}
