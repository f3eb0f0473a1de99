use std::fmt;

use crate::constants::EXIT_FAILED;
use crate::constants::EXIT_LOST;
use crate::constants::EXIT_STOPPED;
use crate::constants::EXIT_SUPERSEDED;
use crate::LeaseId;
use crate::Revision;
use crate::StoreError;

/// Observable lifecycle of a [`crate::NodeRegistration`].
///
/// ```text
/// Idle -> Registering -> Active -> {Lost | Superseded} -> Registering ...
///                     any state -> Closing -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Task spawned, no attempt started yet
    Idle,
    /// Granting a lease and writing the key
    Registering,
    /// Key written under `lease` and being kept alive
    Active {
        lease: LeaseId,
        create_revision: Revision,
    },
    /// Lease or key went away; a new attempt follows after a pause
    Lost,
    /// Another writer re-created the key; it will be re-claimed after a pause
    Superseded,
    /// Stop requested, cleaning up
    Closing,
    /// Terminated, no further store mutation happens
    Closed,
}

impl RegistrationState {
    pub fn is_active(&self) -> bool {
        matches!(self, RegistrationState::Active { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, RegistrationState::Closed)
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            RegistrationState::Idle => write!(f, "idle"),
            RegistrationState::Registering => write!(f, "registering"),
            RegistrationState::Active {
                lease,
                create_revision,
            } => write!(f, "active(lease={lease:#x}, create_revision={create_revision})"),
            RegistrationState::Lost => write!(f, "lost"),
            RegistrationState::Superseded => write!(f, "superseded"),
            RegistrationState::Closing => write!(f, "closing"),
            RegistrationState::Closed => write!(f, "closed"),
        }
    }
}

/// Why an active registration stopped being active
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LossReason {
    /// Renewal stream ended: the lease expired or was revoked
    LeaseExpired,
    KeepAliveFailed(StoreError),
    WatchEnded,
    WatchFailed(StoreError),
    /// The key was deleted behind our back
    KeyDeleted,
}

impl fmt::Display for LossReason {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            LossReason::LeaseExpired => write!(f, "lease expired"),
            LossReason::KeepAliveFailed(e) => write!(f, "keep-alive failed: {e}"),
            LossReason::WatchEnded => write!(f, "key watch ended"),
            LossReason::WatchFailed(e) => write!(f, "key watch failed: {e}"),
            LossReason::KeyDeleted => write!(f, "key deleted"),
        }
    }
}

/// Outcome of one registration attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AttemptExit {
    /// Stop requested
    Stopped,
    /// A store call failed before the attempt became active
    Failed(StoreError),
    Lost(LossReason),
    Superseded,
}

impl AttemptExit {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            AttemptExit::Stopped => EXIT_STOPPED,
            AttemptExit::Failed(_) => EXIT_FAILED,
            AttemptExit::Lost(_) => EXIT_LOST,
            AttemptExit::Superseded => EXIT_SUPERSEDED,
        }
    }

    /// Whether the attempt had reached `Active` before exiting
    pub(crate) fn was_active(&self) -> bool {
        matches!(self, AttemptExit::Lost(_) | AttemptExit::Superseded)
    }
}
