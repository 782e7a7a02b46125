//! Per-sample sandbox configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default VM definition path, relative to the invoking working directory.
pub const DEFAULT_VAGRANTFILE: &str = "Vagrantfile";

/// Configuration for one sample's sandbox.
///
/// Immutable once handed to [`crate::SandboxManager::provision`]. Unknown
/// fields are rejected when deserializing.
///
/// # Example
///
/// ```
/// use vagrant_sandbox::SandboxConfig;
///
/// let config = SandboxConfig::default()
///     .with_vagrantfile_path("tests/Vagrantfile.multi")
///     .with_env("BOX_VERSION", "20240101")
///     .with_primary_vm_name("attacker");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// Path to the VM definition. Relative paths resolve against the
    /// process working directory.
    #[serde(default = "default_vagrantfile_path")]
    pub vagrantfile_path: PathBuf,

    /// Environment variables for this sample's vagrant invocations only.
    /// Never injected into the guest.
    #[serde(default)]
    pub vagrantfile_env_vars: BTreeMap<String, String>,

    /// Entry-point machine; required when the definition declares several.
    #[serde(default)]
    pub primary_vm_name: Option<String>,
}

fn default_vagrantfile_path() -> PathBuf {
    PathBuf::from(DEFAULT_VAGRANTFILE)
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            vagrantfile_path: default_vagrantfile_path(),
            vagrantfile_env_vars: BTreeMap::new(),
            primary_vm_name: None,
        }
    }
}

impl SandboxConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Malformed` on unknown fields or type mismatches,
    /// and any error from [`SandboxConfig::validate`].
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|e| ConfigError::Malformed {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a configuration from an already-parsed JSON value.
    ///
    /// # Errors
    ///
    /// Same as [`SandboxConfig::from_json`].
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_value(value).map_err(|e| ConfigError::Malformed {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the VM definition path.
    #[must_use]
    pub fn with_vagrantfile_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.vagrantfile_path = path.into();
        self
    }

    /// Adds an environment variable for vagrant invocations.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vagrantfile_env_vars.insert(key.into(), value.into());
        self
    }

    /// Adds multiple environment variables from an iterator.
    #[must_use]
    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.vagrantfile_env_vars.insert(k.into(), v.into());
        }
        self
    }

    /// Sets the primary machine name.
    #[must_use]
    pub fn with_primary_vm_name(mut self, name: impl Into<String>) -> Self {
        self.primary_vm_name = Some(name.into());
        self
    }

    /// Checks every field against its validation rule.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidOption` naming the offending option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vagrantfile_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidOption {
                option: "vagrantfile_path",
                reason: "path is empty".to_string(),
            });
        }

        for key in self.vagrantfile_env_vars.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(ConfigError::InvalidOption {
                    option: "vagrantfile_env_vars",
                    reason: format!("invalid variable name {key:?}"),
                });
            }
        }
        for (key, value) in &self.vagrantfile_env_vars {
            if value.contains('\0') {
                return Err(ConfigError::InvalidOption {
                    option: "vagrantfile_env_vars",
                    reason: format!("value of {key} contains a NUL byte"),
                });
            }
        }

        if let Some(primary) = &self.primary_vm_name {
            if primary.trim().is_empty() {
                return Err(ConfigError::InvalidOption {
                    option: "primary_vm_name",
                    reason: "name is empty".to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SandboxConfig::default();
        assert_eq!(config.vagrantfile_path, PathBuf::from("Vagrantfile"));
        assert!(config.vagrantfile_env_vars.is_empty());
        assert!(config.primary_vm_name.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let config = SandboxConfig::new()
            .with_vagrantfile_path("/path/to/Vagrantfile")
            .with_env("FOO", "bar")
            .with_envs([("BAZ", "qux")])
            .with_primary_vm_name("attacker");

        assert_eq!(config.vagrantfile_path, PathBuf::from("/path/to/Vagrantfile"));
        assert_eq!(config.vagrantfile_env_vars.get("FOO"), Some(&String::from("bar")));
        assert_eq!(config.vagrantfile_env_vars.get("BAZ"), Some(&String::from("qux")));
        assert_eq!(config.primary_vm_name.as_deref(), Some("attacker"));
    }

    #[test]
    fn test_from_json_defaults() {
        let config = SandboxConfig::from_json("{}").expect("empty object is valid");
        assert_eq!(config, SandboxConfig::default());
    }

    #[test]
    fn test_from_json_full() {
        let config = SandboxConfig::from_json(
            r#"{
                "vagrantfile_path": "/vms/Vagrantfile",
                "vagrantfile_env_vars": {"FOO": "bar"},
                "primary_vm_name": "web"
            }"#,
        )
        .expect("valid config");
        assert_eq!(config.vagrantfile_path, PathBuf::from("/vms/Vagrantfile"));
        assert_eq!(config.primary_vm_name.as_deref(), Some("web"));
    }

    #[test]
    fn test_from_json_rejects_unknown_field() {
        let err = SandboxConfig::from_json(r#"{"vagrant_file": "x"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
        assert!(err.to_string().contains("vagrant_file"));
    }

    #[test]
    fn test_from_value_rejects_type_mismatch() {
        let err = SandboxConfig::from_value(serde_json::json!({
            "vagrantfile_env_vars": ["FOO=bar"]
        }))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_env_key() {
        let config = SandboxConfig::new().with_env("A=B", "c");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("vagrantfile_env_vars"));
    }

    #[test]
    fn test_validate_rejects_empty_primary() {
        let config = SandboxConfig::new().with_primary_vm_name("  ");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("primary_vm_name"));
    }
}
