//! Filesystem layout for sandbox workspaces.
//!
//! Every materialized workspace lives directly under one cache root, named
//! after the sample it was created for so stray directories can be traced
//! back to their origin.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::WorkspaceError;

/// Directory permissions: owner read/write/execute only (0700).
pub(crate) const DIR_PERMISSIONS: u32 = 0o700;

/// Name of the cache root directory under the user's cache dir.
pub const CACHE_DIR_NAME: &str = "inspect-vagrant-sandbox";

/// File name of the materialized definition inside every workspace.
pub const VAGRANTFILE: &str = "Vagrantfile";

/// Metadata file inside every workspace.
pub const META_FILE: &str = ".sandbox-meta.json";

const UPLOADS_DIR: &str = ".sandbox-uploads";
const TOOL_STATE_DIR: &str = ".vagrant";
const MAX_SLUG_LEN: usize = 40;
const TOKEN_LEN: usize = 12;

/// Paths for one workspace.
///
/// ```text
/// {cache_root}/{sample-slug}-{token}/
/// ├── Vagrantfile          # copy of the VM definition
/// ├── <sibling files>      # files the definition depends on
/// ├── .sandbox-meta.json   # WorkspaceMetadata
/// ├── .sandbox-uploads/    # staging for file copy-in
/// └── .vagrant/            # created by vagrant itself
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    /// Workspace root; vagrant runs with this as its working directory.
    pub root: PathBuf,
    /// The materialized definition.
    pub vagrantfile: PathBuf,
    /// Persisted metadata.
    pub meta_file: PathBuf,
    /// Staging area for uploads.
    pub uploads: PathBuf,
    /// Vagrant's own state directory.
    pub tool_state: PathBuf,
}

impl WorkspacePaths {
    /// Computes the paths for a workspace; creates nothing.
    #[must_use]
    pub fn new(cache_root: &Path, name: &str) -> Self {
        Self::from_root(cache_root.join(name))
    }

    /// Computes the paths for an existing workspace directory.
    #[must_use]
    pub fn from_root(root: PathBuf) -> Self {
        Self {
            vagrantfile: root.join(VAGRANTFILE),
            meta_file: root.join(META_FILE),
            uploads: root.join(UPLOADS_DIR),
            tool_state: root.join(TOOL_STATE_DIR),
            root,
        }
    }

    /// Directory name of this workspace.
    #[must_use]
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Creates the root and uploads directories with 0700 permissions.
    ///
    /// Fails if the root already exists: a workspace is never shared.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::InvalidWorkspace` if the root exists, or
    /// `WorkspaceError::IoError` if creation fails.
    pub fn create_directories(&self) -> Result<(), WorkspaceError> {
        if self.root.exists() {
            return Err(WorkspaceError::InvalidWorkspace {
                reason: format!("workspace already exists: {}", self.root.display()),
            });
        }

        for dir in [&self.root, &self.uploads] {
            create_private_dir(dir)?;
        }

        Ok(())
    }

    /// Removes the workspace directory and everything in it.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::IoError` if removal fails.
    pub fn cleanup(&self) -> Result<(), WorkspaceError> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root).map_err(|e| WorkspaceError::IoError {
                context: format!("failed to remove workspace: {}", self.root.display()),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Checks if this workspace exists on disk.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Validates that the workspace holds a definition.
    ///
    /// # Errors
    ///
    /// Returns `WorkspaceError::InvalidWorkspace` if validation fails.
    pub fn validate(&self) -> Result<(), WorkspaceError> {
        if !self.root.is_dir() {
            return Err(WorkspaceError::InvalidWorkspace {
                reason: format!("not a directory: {}", self.root.display()),
            });
        }
        if !self.vagrantfile.is_file() {
            return Err(WorkspaceError::InvalidWorkspace {
                reason: format!("missing {}: {}", VAGRANTFILE, self.vagrantfile.display()),
            });
        }
        Ok(())
    }
}

fn create_private_dir(dir: &Path) -> Result<(), WorkspaceError> {
    fs::create_dir_all(dir).map_err(|e| WorkspaceError::IoError {
        context: format!("failed to create directory: {}", dir.display()),
        source: e,
    })?;

    let permissions = fs::Permissions::from_mode(DIR_PERMISSIONS);
    fs::set_permissions(dir, permissions).map_err(|e| WorkspaceError::IoError {
        context: format!("failed to set permissions on: {}", dir.display()),
        source: e,
    })
}

/// Builds a workspace directory name: `{slug}-{token}`.
///
/// The slug is the sanitized sample identity, so orphans can be correlated
/// with their sample; the token keeps repeated runs of one sample apart.
#[must_use]
pub fn workspace_name(sample_id: &str) -> String {
    let mut slug = sanitize_name(sample_id);
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }
    if slug.is_empty() {
        slug.push_str("sample");
    }

    let token = Uuid::new_v4().simple().to_string();
    format!("{}-{}", slug, &token[..TOKEN_LEN])
}

/// Lowercases and replaces anything outside `[a-z0-9-]` with `-`,
/// collapsing runs and trimming the ends.
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Resolves symlinks in `path`, falling back to `path` itself when it does
/// not exist.
///
/// Vagrant records environment directories in this form, so comparisons
/// against its output go through here.
#[must_use]
pub fn canonical_path(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Returns the default cache root.
///
/// Uses `XDG_CACHE_HOME` if set, otherwise `~/.cache/`, otherwise `/tmp`.
#[must_use]
pub fn default_cache_root() -> PathBuf {
    if let Some(xdg_cache) = std::env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg_cache).join(CACHE_DIR_NAME);
    }

    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".cache").join(CACHE_DIR_NAME);
    }

    PathBuf::from("/tmp").join(CACHE_DIR_NAME)
}

/// Ensures the cache root exists.
///
/// # Errors
///
/// Returns `WorkspaceError::IoError` if directory creation fails.
pub fn ensure_cache_root(cache_root: &Path) -> Result<(), WorkspaceError> {
    if !cache_root.exists() {
        create_private_dir(cache_root)?;
    }
    Ok(())
}

/// Lists workspace directories under the cache root.
///
/// A directory counts as a workspace if it holds a metadata file or a
/// `Vagrantfile`. A missing cache root yields an empty list.
#[must_use]
pub fn list_workspaces(cache_root: &Path) -> Vec<PathBuf> {
    let mut found: Vec<PathBuf> = walkdir::WalkDir::new(cache_root)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
        .map(walkdir::DirEntry::into_path)
        .filter(|p| p.join(META_FILE).is_file() || p.join(VAGRANTFILE).is_file())
        .collect();
    found.sort();
    found
}
