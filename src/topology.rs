//! Multi-machine topology resolution.
//!
//! Machine names are read statically from the Vagrantfile's
//! `config.vm.define` calls, so a misconfigured primary is reported before
//! vagrant is ever invoked. Names built at load time (interpolation, loop
//! variables, `ENV` lookups) cannot be read this way; [`has_computed_names`]
//! flags those definitions so the caller can ask vagrant instead.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::ConfigError;

/// Machine name vagrant uses when the definition declares none.
pub const DEFAULT_MACHINE: &str = "default";

/// Resolved machines of one sandbox and which of them is the entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    primary: String,
    machines: Vec<String>,
}

impl Topology {
    /// The entry-point machine.
    #[must_use]
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Placeholder for an instance whose machines are not known yet.
    ///
    /// Has no machines and an empty primary; destroying it targets the
    /// whole environment.
    #[must_use]
    pub(crate) fn pending() -> Self {
        Self {
            primary: String::new(),
            machines: Vec::new(),
        }
    }

    /// All declared machines in definition order.
    #[must_use]
    pub fn machines(&self) -> &[String] {
        &self.machines
    }

    #[must_use]
    pub fn is_multi_machine(&self) -> bool {
        self.machines.len() > 1
    }

    #[must_use]
    pub fn contains(&self, machine: &str) -> bool {
        self.machines.iter().any(|m| m == machine)
    }
}

#[allow(clippy::expect_used)]
fn define_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"\.vm\.define\s*\(?\s*(?::([A-Za-z_][A-Za-z0-9_]*)|"([^"]+)"|'([^']+)'|(\S))"#,
        )
        .expect("define regex is valid")
    })
}

/// One `config.vm.define` argument.
enum DefineArg<'a> {
    Literal(&'a str),
    Computed,
}

fn define_args(definition: &str) -> impl Iterator<Item = DefineArg<'_>> {
    definition
        .lines()
        .map(str::trim_start)
        .filter(|code| !code.starts_with('#'))
        .flat_map(|code| define_regex().captures_iter(code))
        .map(|caps| {
            if let Some(dq) = caps.get(2) {
                // Double-quoted strings interpolate.
                if dq.as_str().contains("#{") {
                    return DefineArg::Computed;
                }
                return DefineArg::Literal(dq.as_str());
            }
            match caps.get(1).or_else(|| caps.get(3)) {
                Some(name) => DefineArg::Literal(name.as_str()),
                None => DefineArg::Computed,
            }
        })
}

/// Collects machine names declared with `config.vm.define`.
///
/// Names may be symbols or quoted strings. Comment lines are skipped,
/// duplicates keep their first position, and a definition without any
/// `define` yields `["default"]`. Computed names are not included; see
/// [`has_computed_names`].
#[must_use]
pub fn declared_machines(definition: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let mut any_define = false;

    for arg in define_args(definition) {
        any_define = true;
        if let DefineArg::Literal(name) = arg {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }

    if names.is_empty() && !any_define {
        names.push(DEFAULT_MACHINE.to_string());
    }
    names
}

/// Returns `true` if any `config.vm.define` names its machine with
/// something other than a symbol or plain string literal, e.g.
/// `"node#{i}"`, a block variable, or `ENV["NAME"]`.
///
/// Such definitions only reveal their machines when vagrant loads them.
#[must_use]
pub fn has_computed_names(definition: &str) -> bool {
    define_args(definition).any(|arg| matches!(arg, DefineArg::Computed))
}

/// Chooses the primary machine.
///
/// * One machine, nothing requested: that machine.
/// * Several machines, nothing requested: `AmbiguousPrimary`.
/// * A requested name that is not declared: `UnknownPrimary`.
///
/// # Errors
///
/// Returns the `ConfigError` variants above, or `NoMachines` for an empty
/// declared set.
pub fn resolve(declared: &[String], requested: Option<&str>) -> Result<Topology, ConfigError> {
    if declared.is_empty() {
        return Err(ConfigError::NoMachines);
    }

    let primary = match requested {
        Some(name) => {
            if !declared.iter().any(|m| m == name) {
                return Err(ConfigError::UnknownPrimary {
                    requested: name.to_string(),
                    machines: declared.join(", "),
                });
            }
            name.to_string()
        }
        None if declared.len() == 1 => declared[0].clone(),
        None => {
            return Err(ConfigError::AmbiguousPrimary {
                machines: declared.join(", "),
            });
        }
    };

    Ok(Topology {
        primary,
        machines: declared.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_resolve_single_default() {
        let t = resolve(&names(&["a"]), None).expect("single machine");
        assert_eq!(t.primary(), "a");
        assert!(!t.is_multi_machine());
    }

    #[test]
    fn test_resolve_ambiguous() {
        let err = resolve(&names(&["a", "b"]), None).unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousPrimary { .. }));
    }

    #[test]
    fn test_resolve_unknown() {
        let err = resolve(&names(&["a", "b"]), Some("c")).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownPrimary { ref requested, .. } if requested == "c"
        ));
    }

    #[test]
    fn test_resolve_explicit() {
        let t = resolve(&names(&["a", "b"]), Some("b")).expect("explicit primary");
        assert_eq!(t.primary(), "b");
        assert_eq!(t.machines(), names(&["a", "b"]).as_slice());
        assert!(t.contains("a"));
        assert!(!t.contains("c"));
    }

    #[test]
    fn test_resolve_unknown_single() {
        let err = resolve(&names(&["default"]), Some("web")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownPrimary { .. }));
    }

    #[test]
    fn test_resolve_empty() {
        assert!(matches!(resolve(&[], None), Err(ConfigError::NoMachines)));
    }

    #[test]
    fn test_declared_machines_multi() {
        let vf = r#"
Vagrant.configure("2") do |config|
  config.vm.box = "generic/ubuntu2204"

  config.vm.define "attacker" do |attacker|
    attacker.vm.hostname = "attacker"
  end

  config.vm.define :victim, primary: true do |victim|
  end

  # config.vm.define "disabled"
  config.vm.define('web') { |w| }
  config.vm.define "attacker"
end
"#;
        assert_eq!(declared_machines(vf), names(&["attacker", "victim", "web"]));
    }

    #[test]
    fn test_computed_names_detected() {
        let looped = r#"
Vagrant.configure("2") do |config|
  (1..2).each do |i|
    config.vm.define "node#{i}" do |node|
    end
  end
end
"#;
        assert!(has_computed_names(looped));
        assert!(declared_machines(looped).is_empty());

        let by_variable = "%w[web db].each do |name|\n  config.vm.define name do |m|\n  end\nend\n";
        assert!(has_computed_names(by_variable));

        let from_env = "config.vm.define ENV['BOX_NAME'] do |m|\nend\n";
        assert!(has_computed_names(from_env));

        let mixed = "config.vm.define :gateway\nconfig.vm.define \"node#{n}\"\n";
        assert!(has_computed_names(mixed));
        assert_eq!(declared_machines(mixed), names(&["gateway"]));
    }

    #[test]
    fn test_literal_names_not_computed() {
        let vf = "config.vm.define \"web\"\nconfig.vm.define :db\nconfig.vm.define('cache')\n\
                  # config.vm.define \"x#{i}\"\n";
        assert!(!has_computed_names(vf));
        assert_eq!(declared_machines(vf), names(&["web", "db", "cache"]));
        assert!(!has_computed_names("config.vm.box = \"x\"\n"));
    }

    #[test]
    fn test_declared_machines_single_default() {
        let vf = "Vagrant.configure(\"2\") do |config|\n  config.vm.box = \"x\"\nend\n";
        assert_eq!(declared_machines(vf), names(&["default"]));
    }
}
