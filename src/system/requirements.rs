//! Host checks: a runnable vagrant and a writable cache root.

use std::fs;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::SystemRequirementsError;
use crate::workspace::DIR_PERMISSIONS;

/// Results of all host checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemRequirements {
    /// Version reported by `vagrant --version` (e.g., "2.4.1")
    pub vagrant_version: String,
    /// Cache root that was verified writable
    pub cache_root: PathBuf,
}

/// Runs every host check.
///
/// # Errors
///
/// Returns the first failing requirement.
pub fn check_all(
    program: &Path,
    cache_root: &Path,
) -> Result<SystemRequirements, SystemRequirementsError> {
    let vagrant_version = check_vagrant(program)?;
    check_cache_root_writable(cache_root)?;

    Ok(SystemRequirements {
        vagrant_version,
        cache_root: cache_root.to_path_buf(),
    })
}

/// Runs `<program> --version` and returns the version number.
///
/// # Errors
///
/// Returns `VagrantUnavailable` if the program cannot be run, and
/// `UnparsableVersion` if its output is not a vagrant version line.
pub fn check_vagrant(program: &Path) -> Result<String, SystemRequirementsError> {
    let output = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| SystemRequirementsError::VagrantUnavailable {
            program: program.display().to_string(),
            source: e,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        return Err(SystemRequirementsError::UnparsableVersion {
            output: format!("{}{}", stdout, String::from_utf8_lossy(&output.stderr)),
        });
    }

    parse_vagrant_version(&stdout)
}

/// Parses `Vagrant 2.4.1` (possibly followed by update notices).
fn parse_vagrant_version(output: &str) -> Result<String, SystemRequirementsError> {
    output
        .lines()
        .find_map(|line| {
            let version = line.trim().strip_prefix("Vagrant ")?.trim();
            let mut parts = version.split('.');
            let major = parts.next()?;
            let minor = parts.next()?;
            (major.parse::<u32>().is_ok() && minor.parse::<u32>().is_ok())
                .then(|| version.to_string())
        })
        .ok_or_else(|| SystemRequirementsError::UnparsableVersion {
            output: output.trim().to_string(),
        })
}

/// Creates the cache root if needed and verifies a file can be written in it.
///
/// # Errors
///
/// Returns `CacheRootUnwritable` if the directory cannot be created or
/// written to.
pub fn check_cache_root_writable(cache_root: &Path) -> Result<(), SystemRequirementsError> {
    let unwritable = |source| SystemRequirementsError::CacheRootUnwritable {
        path: cache_root.to_path_buf(),
        source,
    };

    if !cache_root.exists() {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_PERMISSIONS)
            .create(cache_root)
            .map_err(unwritable)?;
    }

    let marker = cache_root.join(format!(".write-check-{}", std::process::id()));
    fs::File::create(&marker)
        .and_then(|mut f| f.write_all(b"ok"))
        .map_err(unwritable)?;
    fs::remove_file(&marker).map_err(unwritable)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_parse_vagrant_version_standard() {
        let version = parse_vagrant_version("Vagrant 2.4.1\n").expect("should parse");
        assert_eq!(version, "2.4.1");
    }

    #[test]
    fn test_parse_vagrant_version_with_notice() {
        let output = "Vagrant 2.3.7\n\nLatest Version: 2.4.1\nTo upgrade visit: https://www.vagrantup.com/downloads.html\n";
        let version = parse_vagrant_version(output).expect("should parse");
        assert_eq!(version, "2.3.7");
    }

    #[test]
    fn test_parse_vagrant_version_garbage() {
        assert!(parse_vagrant_version("command not found").is_err());
        assert!(parse_vagrant_version("Vagrant x.y").is_err());
        assert!(parse_vagrant_version("").is_err());
    }

    #[test]
    fn test_check_vagrant_missing_program() {
        let result = check_vagrant(Path::new("/nonexistent/vagrant-binary"));
        assert!(matches!(
            result,
            Err(SystemRequirementsError::VagrantUnavailable { .. })
        ));
    }

    #[test]
    fn test_check_vagrant_fake_program() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let program = dir.path().join("vagrant");
        fs::write(&program, "#!/bin/sh\necho 'Vagrant 2.4.1'\n").expect("write script");
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).expect("chmod");

        assert_eq!(check_vagrant(&program).expect("should pass"), "2.4.1");
    }

    #[test]
    fn test_check_cache_root_creates_directory() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let root = dir.path().join("nested").join("cache");

        check_cache_root_writable(&root).expect("should be writable");

        assert!(root.is_dir());
        assert_eq!(fs::read_dir(&root).expect("read dir").count(), 0);
    }

    #[test]
    fn test_check_cache_root_not_a_directory() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let file = dir.path().join("file");
        fs::write(&file, "x").expect("write file");

        assert!(matches!(
            check_cache_root_writable(&file.join("cache")),
            Err(SystemRequirementsError::CacheRootUnwritable { .. })
        ));
    }
}
