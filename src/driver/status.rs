//! Parsers for `vagrant status --machine-readable` and `vagrant global-status`.

use std::path::PathBuf;

/// One machine reported by `vagrant status --machine-readable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineStatus {
    pub name: String,
    /// Vagrant's state id, e.g. `running`, `poweroff`, `not_created`.
    pub state: String,
    pub provider: Option<String>,
}

impl MachineStatus {
    /// Returns `true` if vagrant reports no VM behind this machine.
    #[must_use]
    pub fn is_not_created(&self) -> bool {
        self.state == "not_created"
    }
}

/// One row of `vagrant global-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalStatusEntry {
    /// Global machine id (usable as a `destroy` target from any directory).
    pub id: String,
    pub name: String,
    pub provider: String,
    pub state: String,
    pub directory: PathBuf,
}

/// Parses `vagrant status --machine-readable` output.
///
/// Lines are `timestamp,target,type,data[,...]`. Only the `state` and
/// `provider-name` types are used; machines keep first-seen order.
#[must_use]
pub fn parse_machine_status(output: &str) -> Vec<MachineStatus> {
    let mut machines: Vec<MachineStatus> = Vec::new();

    for line in output.lines() {
        let mut parts = line.splitn(4, ',');
        let (Some(_ts), Some(target), Some(kind), Some(data)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if target.is_empty() {
            continue;
        }
        let data = data.split(',').next().unwrap_or_default().trim();

        let idx = match machines.iter().position(|m| m.name == target) {
            Some(idx) => idx,
            None if kind == "state" || kind == "provider-name" => {
                machines.push(MachineStatus {
                    name: target.to_string(),
                    state: String::new(),
                    provider: None,
                });
                machines.len() - 1
            }
            None => continue,
        };

        match kind {
            "state" => machines[idx].state = data.to_string(),
            "provider-name" => machines[idx].provider = Some(data.to_string()),
            _ => {}
        }
    }

    machines
}

/// Parses the table printed by `vagrant global-status`.
///
/// Rows start after the dashed separator and end at the first blank line.
/// The directory column is everything after the fourth field, so paths
/// containing spaces survive. Rows without an absolute directory are skipped.
#[must_use]
pub fn parse_global_status(output: &str) -> Vec<GlobalStatusEntry> {
    let mut entries = Vec::new();
    let mut in_table = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if !in_table {
            if trimmed.starts_with("---") {
                in_table = true;
            }
            continue;
        }
        if trimmed.is_empty() {
            break;
        }

        let mut rest = trimmed;
        let mut fields = Vec::with_capacity(4);
        for _ in 0..4 {
            let Some((field, tail)) = rest.split_once(char::is_whitespace) else {
                break;
            };
            fields.push(field);
            rest = tail.trim_start();
        }
        // Footer prose ("There are no active Vagrant environments...") splits
        // into enough words to look like a row; a real row ends in a path.
        if fields.len() < 4 || !rest.starts_with('/') {
            continue;
        }

        entries.push(GlobalStatusEntry {
            id: fields[0].to_string(),
            name: fields[1].to_string(),
            provider: fields[2].to_string(),
            state: fields[3].to_string(),
            directory: PathBuf::from(rest.trim_end()),
        });
    }

    entries
}

const ABSENT_MARKERS: &[&str] = &[
    "not created",
    "could not be found",
    "couldn't find",
    "A Vagrant environment or target machine is required",
];

/// Returns `true` if a failed destroy means "nothing was there to destroy".
#[must_use]
pub fn is_already_absent(stdout: &str, stderr: &str) -> bool {
    ABSENT_MARKERS
        .iter()
        .any(|m| stderr.contains(m) || stdout.contains(m))
}
