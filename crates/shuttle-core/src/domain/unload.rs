//! Why a partition is being torn down.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reason attached to a partition when it starts unloading.
///
/// Recorded once; later `stop` calls with another cause are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnloadCause {
    /// No poller or task activity within the idle threshold.
    Idle,
    /// Another node took the partition; our backlog writes are fenced.
    OwnershipLost,
    /// Queue configuration changed in a way that needs a fresh instance.
    ConfigChange,
    /// The owning manager is shutting down.
    ManagerShutdown,
}

impl UnloadCause {
    /// Whether callers should re-resolve the queue key and retry on a fresh partition.
    ///
    /// Only a manager shutdown means nobody on this node will serve the key again.
    pub fn is_retryable_elsewhere(self) -> bool {
        !matches!(self, UnloadCause::ManagerShutdown)
    }

    pub fn as_label(self) -> &'static str {
        match self {
            UnloadCause::Idle => "idle",
            UnloadCause::OwnershipLost => "ownership_lost",
            UnloadCause::ConfigChange => "config_change",
            UnloadCause::ManagerShutdown => "manager_shutdown",
        }
    }
}

impl fmt::Display for UnloadCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}
