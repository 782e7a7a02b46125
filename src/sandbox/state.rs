//! Lifecycle states of a sandbox instance.

use serde::{Deserialize, Serialize};

/// State of a sandbox instance.
///
/// ```text
/// NotStarted → Provisioning → Ready ⇄ Executing
///                   │           │        │
///                   ▼           ▼        ▼
///                Errored ─→ TearingDown ─→ Destroyed
///                   ▲           │
///                   └───────────┘
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    /// Registered, nothing spawned yet.
    #[default]
    NotStarted,
    /// Workspace materialized, bring-up in progress.
    Provisioning,
    /// Machines up, accepting commands.
    Ready,
    /// One or more commands or file transfers in flight.
    Executing,
    /// Destroy in progress.
    TearingDown,
    /// Machines destroyed and workspace released.
    Destroyed,
    /// Bring-up, a command, or destroy failed; waiting for teardown or a sweep.
    Errored,
}

impl SandboxState {
    /// Returns `true` if the lifecycle permits moving from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use SandboxState::{
            Destroyed, Errored, Executing, NotStarted, Provisioning, Ready, TearingDown,
        };
        matches!(
            (self, next),
            (NotStarted, Provisioning)
                | (Provisioning, Ready | Errored)
                | (Ready, Executing | TearingDown)
                | (Executing, Ready | Errored)
                | (Errored, TearingDown)
                | (TearingDown, Destroyed | Errored)
        )
    }

    /// Returns `true` if commands and file transfers are accepted.
    #[must_use]
    pub fn accepts_operations(self) -> bool {
        matches!(self, Self::Ready | Self::Executing)
    }

    /// Returns `true` if a transition is being driven right now.
    #[must_use]
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Provisioning | Self::TearingDown)
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "notstarted"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Ready => write!(f, "ready"),
            Self::Executing => write!(f, "executing"),
            Self::TearingDown => write!(f, "tearingdown"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Errored => write!(f, "errored"),
        }
    }
}
