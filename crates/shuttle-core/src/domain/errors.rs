//! Errors - エラー型と分類
//!
//! 呼び出し側がリトライ方針を決められるよう、`ErrorKind` で運用分類します。
//! エンジン自身は `spool_task` を暗黙にリトライしません。

use thiserror::Error;

use crate::ports::BacklogError;

/// Operational classification of a `MatchingError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry against the same partition.
    Transient,
    /// Re-resolve the queue key and retry against a fresh partition.
    Lifecycle,
    /// The caller gave up (cancellation, deadline).
    Caller,
    /// Misuse of the API.
    Permanent,
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum MatchingError {
    /// The partition is stopping or stopped.
    #[error("task queue partition unavailable")]
    Unavailable,

    #[error("backlog: {0}")]
    Backlog(#[from] BacklogError),

    #[error("operation cancelled")]
    Cancelled,

    /// Routing/versioning data changed while a spooled task was waiting for a poller.
    #[error("user data changed while dispatching")]
    UserDataChanged,

    #[error("no poller accepted the request before the deadline")]
    DeadlineExceeded,

    /// The poller took a query/nexus request but dropped it without responding.
    #[error("poller dropped the request without responding")]
    ResponderDropped,

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl MatchingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MatchingError::Unavailable => ErrorKind::Lifecycle,
            MatchingError::Backlog(BacklogError::OwnershipLost) => ErrorKind::Lifecycle,
            MatchingError::Backlog(_) => ErrorKind::Transient,
            MatchingError::Cancelled | MatchingError::DeadlineExceeded => ErrorKind::Caller,
            MatchingError::UserDataChanged | MatchingError::ResponderDropped => {
                ErrorKind::Transient
            }
            MatchingError::InvalidState(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Lifecycle)
    }

    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            MatchingError::Unavailable => "unavailable",
            MatchingError::Backlog(_) => "backlog",
            MatchingError::Cancelled => "cancelled",
            MatchingError::UserDataChanged => "user_data_changed",
            MatchingError::DeadlineExceeded => "deadline_exceeded",
            MatchingError::ResponderDropped => "responder_dropped",
            MatchingError::InvalidState(_) => "invalid_state",
        }
    }
}
