//! Partition lifecycle state machine.
//!
//! ```text
//! Created -> Starting -> Running -> Stopping -> Stopped
//!    |          |                      ^
//!    +----------+----------------------+   (stop from any state)
//! ```
//!
//! Every public partition operation checks `ensure_running` on entry. `Stopped` is
//! terminal: the instance is never restarted, the owner builds a new one.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::domain::{MatchingError, UnloadCause};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl PartitionState {
    pub fn is_terminating(self) -> bool {
        matches!(self, PartitionState::Stopping | PartitionState::Stopped)
    }
}

pub struct Lifecycle {
    state: watch::Sender<PartitionState>,
    cause: OnceLock<UnloadCause>,
    shutdown: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PartitionState::Created);
        Self {
            state,
            cause: OnceLock::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> PartitionState {
        *self.state.borrow()
    }

    /// Cause recorded by the first `begin_stop`.
    pub fn cause(&self) -> Option<UnloadCause> {
        self.cause.get().copied()
    }

    /// Cancelled as soon as stopping begins.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// `Created -> Starting`. Returns `Ok(false)` if already starting or running.
    pub fn begin_start(&self) -> Result<bool, MatchingError> {
        let mut outcome = Ok(false);
        self.state.send_if_modified(|s| match *s {
            PartitionState::Created => {
                *s = PartitionState::Starting;
                outcome = Ok(true);
                true
            }
            PartitionState::Starting | PartitionState::Running => false,
            PartitionState::Stopping | PartitionState::Stopped => {
                outcome = Err(MatchingError::Unavailable);
                false
            }
        });
        outcome
    }

    /// `Starting -> Running`. No-op if a stop raced ahead.
    pub fn mark_running(&self) -> bool {
        self.state.send_if_modified(|s| {
            if *s == PartitionState::Starting {
                *s = PartitionState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Enter `Stopping`. Only the first caller wins and gets its cause recorded.
    pub fn begin_stop(&self, cause: UnloadCause) -> bool {
        let won = self.state.send_if_modified(|s| {
            if s.is_terminating() {
                false
            } else {
                *s = PartitionState::Stopping;
                true
            }
        });
        if won {
            let _ = self.cause.set(cause);
            self.shutdown.cancel();
        }
        won
    }

    pub fn mark_stopped(&self) {
        self.state.send_replace(PartitionState::Stopped);
    }

    pub fn ensure_running(&self) -> Result<(), MatchingError> {
        match self.state() {
            PartitionState::Running => Ok(()),
            _ => Err(MatchingError::Unavailable),
        }
    }

    /// Wait for `Running`. Fails if the partition stops first or `cancel` fires.
    pub async fn wait_until_running(&self, cancel: &CancellationToken) -> Result<(), MatchingError> {
        let mut rx = self.state.subscribe();
        tokio::select! {
            res = rx.wait_for(|s| *s == PartitionState::Running || s.is_terminating()) => {
                match res.map(|s| *s) {
                    Ok(PartitionState::Running) => Ok(()),
                    _ => Err(MatchingError::Unavailable),
                }
            }
            _ = cancel.cancelled() => Err(MatchingError::Cancelled),
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
