//! Copies a VM definition and its sibling files into a fresh workspace.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use tracing::{debug, trace, warn};
use walkdir::WalkDir;

use super::meta::WorkspaceMetadata;
use super::storage::{VAGRANTFILE, WorkspacePaths, canonical_path};
use crate::error::WorkspaceError;

/// Sibling copies above this size are logged at warn.
const LARGE_COPY_BYTES: u64 = 256 * 1024 * 1024;

/// What a sibling copy moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CopyStats {
    files: u64,
    bytes: u64,
}

/// Materializes `definition` into `paths.root` and writes `metadata`.
///
/// The metadata file is written first, right after the directory is
/// created, so the workspace never becomes visible to a sweep without its
/// owner pid. The definition is then copied as `Vagrantfile`. Non-hidden
/// siblings of the definition (files it may `require` or provision from)
/// are copied recursively; symlinks are recreated rather than followed. The
/// source tree is only ever read.
///
/// # Errors
///
/// Returns `WorkspaceError::DefinitionNotFound` if the definition is missing,
/// `WorkspaceError::InvalidWorkspace` if the workspace already exists, or
/// `WorkspaceError::IoError` on copy failures. A partially written workspace
/// is removed before returning an error.
pub fn materialize(
    definition: &Path,
    paths: &WorkspacePaths,
    metadata: &WorkspaceMetadata,
) -> Result<(), WorkspaceError> {
    if !definition.is_file() {
        return Err(WorkspaceError::DefinitionNotFound {
            path: definition.to_path_buf(),
        });
    }

    paths.create_directories()?;

    let result = metadata
        .save(&paths.meta_file)
        .and_then(|()| populate(definition, paths));
    if result.is_err() {
        if let Err(e) = paths.cleanup() {
            debug!(error = %e, root = %paths.root.display(), "failed to remove partial workspace");
        }
    }
    result
}

fn populate(definition: &Path, paths: &WorkspacePaths) -> Result<(), WorkspaceError> {
    fs::copy(definition, &paths.vagrantfile).map_err(|e| WorkspaceError::IoError {
        context: format!(
            "failed to copy {} to {}",
            definition.display(),
            paths.vagrantfile.display()
        ),
        source: e,
    })?;

    let source_dir = definition
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let stats = copy_siblings(source_dir, definition, &paths.root)?;

    if stats.bytes > LARGE_COPY_BYTES {
        warn!(
            source = %source_dir.display(),
            files = stats.files,
            bytes = stats.bytes,
            "large sibling copy; consider moving the definition into its own directory"
        );
    }
    debug!(
        workspace = %paths.root.display(),
        definition = %definition.display(),
        files = stats.files,
        bytes = stats.bytes,
        "workspace materialized"
    );
    Ok(())
}

fn copy_siblings(
    source_dir: &Path,
    definition: &Path,
    dest: &Path,
) -> Result<CopyStats, WorkspaceError> {
    let definition_name = definition.file_name();
    // The cache root may live inside the source dir; never copy workspaces into each other.
    let excluded = canonical_path(dest.parent().unwrap_or(dest));
    let mut stats = CopyStats::default();

    let walker = WalkDir::new(source_dir)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            if is_hidden(e.file_name()) {
                return false;
            }
            if canonical_path(e.path()).starts_with(&excluded) {
                trace!(path = %e.path().display(), "skipping cache root inside source");
                return false;
            }
            true
        });

    for entry in walker {
        let entry = entry.map_err(|e| WorkspaceError::IoError {
            context: format!("failed to walk {}", source_dir.display()),
            source: e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
        })?;

        let relative = match entry.path().strip_prefix(source_dir) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };

        if entry.depth() == 1 {
            let name = entry.file_name();
            if Some(name) == definition_name || name == VAGRANTFILE {
                continue;
            }
        }

        if let Some(bytes) = copy_entry(&entry, &dest.join(&relative))? {
            stats.files += 1;
            stats.bytes += bytes;
        }
    }

    Ok(stats)
}

/// Copies one entry; returns the byte count for regular files.
fn copy_entry(entry: &walkdir::DirEntry, target: &Path) -> Result<Option<u64>, WorkspaceError> {
    let file_type = entry.file_type();
    let io_err =
        |context: String| move |e: std::io::Error| WorkspaceError::IoError { context, source: e };

    if file_type.is_dir() {
        fs::create_dir_all(target)
            .map_err(io_err(format!("failed to create {}", target.display())))?;
    } else if file_type.is_symlink() {
        let link = fs::read_link(entry.path())
            .map_err(io_err(format!("failed to read link {}", entry.path().display())))?;
        symlink(&link, target)
            .map_err(io_err(format!("failed to create link {}", target.display())))?;
    } else if file_type.is_file() {
        let bytes = fs::copy(entry.path(), target).map_err(io_err(format!(
            "failed to copy {} to {}",
            entry.path().display(),
            target.display()
        )))?;
        return Ok(Some(bytes));
    }
    Ok(None)
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, PathBuf) {
        let src = TempDir::new().expect("tempdir");
        let def = src.path().join("Vagrantfile.multi");
        fs::write(&def, "Vagrant.configure('2') {}\n").expect("write def");
        fs::write(src.path().join("provision.sh"), "echo hi\n").expect("write sibling");
        fs::create_dir(src.path().join("files")).expect("mkdir");
        fs::write(src.path().join("files/flag.txt"), "flag\n").expect("write nested");
        fs::create_dir(src.path().join(".vagrant")).expect("mkdir hidden");
        fs::write(src.path().join(".vagrant/state"), "x").expect("write hidden");
        fs::write(src.path().join("Vagrantfile"), "other").expect("write other def");
        (src, def)
    }

    #[test]
    fn test_materialize_copies_definition_and_siblings() {
        let (src, def) = fixture();
        let cache = TempDir::new().expect("cache");
        let paths = WorkspacePaths::new(cache.path(), "ws");
        let meta = WorkspaceMetadata::new("sb", "sample", &def);

        materialize(&def, &paths, &meta).expect("materialize");

        assert_eq!(
            fs::read_to_string(&paths.vagrantfile).expect("read"),
            "Vagrant.configure('2') {}\n"
        );
        assert!(paths.root.join("provision.sh").is_file());
        assert!(paths.root.join("files/flag.txt").is_file());
        assert!(!paths.root.join("Vagrantfile.multi").exists());
        assert!(!paths.tool_state.join("state").exists());
        assert!(paths.meta_file.is_file());

        // Source untouched.
        assert!(src.path().join(".vagrant/state").is_file());
        assert_eq!(fs::read_to_string(src.path().join("Vagrantfile")).expect("read"), "other");
    }

    #[test]
    fn test_copy_siblings_counts_files_and_bytes() {
        let (src, def) = fixture();
        let dest = TempDir::new().expect("dest");
        let root = dest.path().join("ws");
        fs::create_dir(&root).expect("mkdir");

        let stats = copy_siblings(src.path(), &def, &root).expect("copy");

        // provision.sh and files/flag.txt; hidden entries and other definitions are skipped.
        assert_eq!(stats, CopyStats { files: 2, bytes: 13 });
    }

    #[test]
    fn test_materialize_metadata_records_owner() {
        let (_src, def) = fixture();
        let cache = TempDir::new().expect("cache");
        let paths = WorkspacePaths::new(cache.path(), "ws");

        materialize(&def, &paths, &WorkspaceMetadata::new("sb", "s", &def)).expect("materialize");

        let meta = WorkspaceMetadata::load(&paths.meta_file).expect("load");
        assert_eq!(meta.owner_pid, std::process::id());
        assert!(!paths.meta_file.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_materialize_recreates_symlinks() {
        let (src, def) = fixture();
        symlink("files/flag.txt", src.path().join("flag-link")).expect("symlink");

        let cache = TempDir::new().expect("cache");
        let paths = WorkspacePaths::new(cache.path(), "ws");
        materialize(&def, &paths, &WorkspaceMetadata::new("sb", "s", &def)).expect("materialize");

        let link = paths.root.join("flag-link");
        assert!(fs::symlink_metadata(&link).expect("lstat").file_type().is_symlink());
        assert_eq!(fs::read_link(&link).expect("readlink"), PathBuf::from("files/flag.txt"));
    }

    #[test]
    fn test_materialize_missing_definition() {
        let cache = TempDir::new().expect("cache");
        let paths = WorkspacePaths::new(cache.path(), "ws");
        let missing = cache.path().join("nope/Vagrantfile");

        let err = materialize(&missing, &paths, &WorkspaceMetadata::new("sb", "s", &missing))
            .unwrap_err();
        assert!(matches!(err, WorkspaceError::DefinitionNotFound { .. }));
        assert!(!paths.exists());
    }

    #[test]
    fn test_materialize_skips_cache_root_inside_source() {
        let (src, def) = fixture();
        let cache_root = src.path().join("cache");
        fs::create_dir(&cache_root).expect("mkdir");
        let paths = WorkspacePaths::new(&cache_root, "ws");

        materialize(&def, &paths, &WorkspaceMetadata::new("sb", "s", &def)).expect("materialize");
        assert!(!paths.root.join("cache").exists());
        assert!(paths.root.join("files/flag.txt").is_file());
    }
}
