//! Guest command requests and the shell line sent over `vagrant ssh`.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::driver::ProcessResult;
use crate::error::ConfigError;

/// A command to run inside a sandbox machine.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use vagrant_sandbox::ExecRequest;
///
/// let req = ExecRequest::new(["ls", "-la", "/tmp/my dir"])
///     .with_cwd("/home/vagrant")
///     .with_env("LANG", "C")
///     .with_timeout(Duration::from_secs(30));
/// assert!(req.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// Program and arguments; each element is quoted separately.
    pub argv: Vec<String>,
    /// Bytes written to the command's stdin. `None` means `/dev/null`.
    pub input: Option<Vec<u8>>,
    /// Working directory inside the guest.
    pub cwd: Option<String>,
    /// Variables exported inside the guest for this command only.
    pub env: BTreeMap<String, String>,
    /// Guest user to run as, via `sudo -n -u`.
    pub user: Option<String>,
    /// Upper bound on the command; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Target machine; the primary when unset.
    pub machine: Option<String>,
}

impl ExecRequest {
    #[must_use]
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn on_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = Some(machine.into());
        self
    }

    /// Checks the request before anything is spawned.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidOption` for an empty argv, a zero
    /// timeout, or an env name that is not a shell identifier.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.argv.is_empty() {
            return Err(ConfigError::InvalidOption {
                option: "cmd",
                reason: "command is empty".to_string(),
            });
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::InvalidOption {
                option: "timeout",
                reason: "timeout must be positive".to_string(),
            });
        }
        if let Some(key) = self.env.keys().find(|k| !is_shell_identifier(k)) {
            return Err(ConfigError::InvalidOption {
                option: "env",
                reason: format!("{key:?} is not a valid variable name"),
            });
        }
        if self.user.as_deref().is_some_and(|u| u.trim().is_empty()) {
            return Err(ConfigError::InvalidOption {
                option: "user",
                reason: "user is empty".to_string(),
            });
        }
        Ok(())
    }

    /// Renders the shell line passed to `vagrant ssh --command`.
    #[must_use]
    pub fn remote_command(&self) -> String {
        build_remote_command(
            &self.argv,
            self.cwd.as_deref(),
            &self.env,
            self.user.as_deref(),
        )
    }
}

/// Result of a guest command. A non-zero exit is an ordinary outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl From<ProcessResult> for ExecOutput {
    fn from(result: ProcessResult) -> Self {
        Self {
            success: result.success(),
            exit_code: result.exit_code,
            stdout: result.stdout_lossy(),
            stderr: result.stderr_lossy(),
        }
    }
}

/// Quotes a string for use as one shell word.
///
/// Safe strings pass through unchanged; everything else is single-quoted.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    let safe = |c: char| {
        c.is_ascii_alphanumeric()
            || matches!(c, '-' | '_' | '.' | '/' | ':' | '=' | '@' | '+' | ',')
    };
    if s.chars().all(safe) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Joins words into a shell command line, quoting each.
#[must_use]
pub fn shell_join<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|w| shell_quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Builds the guest shell line: exports, `cd`, then the quoted argv, wrapped
/// in `sudo -n -u <user> -- sh -c` when a user is given.
#[must_use]
pub fn build_remote_command(
    argv: &[String],
    cwd: Option<&str>,
    env: &BTreeMap<String, String>,
    user: Option<&str>,
) -> String {
    let mut script = String::new();
    if !env.is_empty() {
        let assignments: Vec<String> = env
            .iter()
            .map(|(k, v)| format!("{}={}", k, shell_quote(v)))
            .collect();
        script.push_str("export ");
        script.push_str(&assignments.join(" "));
        script.push_str("; ");
    }
    if let Some(dir) = cwd {
        script.push_str("cd ");
        script.push_str(&shell_quote(dir));
        script.push_str(" && ");
    }
    script.push_str(&shell_join(argv));

    match user {
        Some(user) => format!(
            "sudo -n -u {} -- sh -c {}",
            shell_quote(user),
            shell_quote(&script)
        ),
        None => script,
    }
}

fn is_shell_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
