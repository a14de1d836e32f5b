//! Task model: the persisted `TaskInfo` and the in-flight `Task`.
//!
//! A `Task` is always in exactly one place: parked in the rendezvous, in the
//! hands of one poll attempt, or (as its `TaskInfo`) at rest in the backlog.
//! The producer/dispatcher learns that a poller really took it through the
//! one-shot acceptance signal the task carries; if the task is dropped
//! instead, the signal's receiver observes the drop and re-offers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::oneshot;

use super::ids::{RequestId, SequenceId, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NamespaceId(String);

impl NamespaceId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Priority class. Lower value = more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(1);
    pub const DEFAULT: Priority = Priority(3);
    pub const LOWEST: Priority = Priority(5);

    pub fn new(level: u8) -> Self {
        Self(level.clamp(Self::HIGHEST.0, Self::LOWEST.0))
    }

    pub fn level(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Versioning directive carried by a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "build_id")]
pub enum VersioningTag {
    /// Any poller may take the task.
    #[default]
    Unversioned,
    /// Only pollers running this build may take the task.
    Pinned(String),
}

/// Persisted form of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub namespace: NamespaceId,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Not-before time. Pollers never receive the task earlier.
    pub visible_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Key of whatever produced the task (e.g. a workflow run), if any.
    pub origin_key: Option<String>,
    pub priority: Priority,
    pub versioning: VersioningTag,
}

impl TaskInfo {
    pub fn new(
        task_id: TaskId,
        namespace: NamespaceId,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            namespace,
            payload,
            created_at: now,
            visible_at: now,
            expires_at: None,
            origin_key: None,
            priority: Priority::DEFAULT,
            versioning: VersioningTag::Unversioned,
        }
    }

    pub fn with_visible_at(mut self, visible_at: DateTime<Utc>) -> Self {
        self.visible_at = visible_at;
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_origin_key(mut self, key: impl Into<String>) -> Self {
        self.origin_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_versioning(mut self, versioning: VersioningTag) -> Self {
        self.versioning = versioning;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now
    }
}

/// Request/response task flavour (never spooled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Query,
    Nexus,
}

/// Where a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSource {
    /// Handed over directly by a producer.
    SyncMatch,
    /// Read back from the backlog.
    Backlog(SequenceId),
    /// A query / nexus request waiting on a response.
    Request(RequestId, RequestKind),
}

impl TaskSource {
    pub fn is_backlog(&self) -> bool {
        matches!(self, TaskSource::Backlog(_))
    }
}

/// A task travelling through the rendezvous.
#[derive(Debug)]
pub struct Task {
    info: TaskInfo,
    source: TaskSource,
    accepted: Option<oneshot::Sender<()>>,
    responder: Option<oneshot::Sender<serde_json::Value>>,
}

/// Receiving half of the acceptance signal.
pub(crate) type Acceptance = oneshot::Receiver<()>;

impl Task {
    /// Build an in-flight task and the receiver that resolves once a poller accepts it.
    pub(crate) fn in_flight(info: TaskInfo, source: TaskSource) -> (Self, Acceptance) {
        let (tx, rx) = oneshot::channel();
        let task = Self {
            info,
            source,
            accepted: Some(tx),
            responder: None,
        };
        (task, rx)
    }

    pub(crate) fn with_responder(mut self, tx: oneshot::Sender<serde_json::Value>) -> Self {
        self.responder = Some(tx);
        self
    }

    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    pub fn source(&self) -> TaskSource {
        self.source
    }

    /// Hand the task to the caller of a poll. Consumes the task so it can't be accepted twice.
    pub(crate) fn accept(mut self) -> PolledTask {
        if let Some(tx) = self.accepted.take() {
            // The producer may have stopped waiting; the poller still owns the task.
            let _ = tx.send(());
        }
        PolledTask {
            info: self.info,
            source: self.source,
            responder: self.responder.map(|tx| Responder { tx }),
        }
    }
}

/// What a poll returns to the worker.
#[derive(Debug)]
pub struct PolledTask {
    info: TaskInfo,
    source: TaskSource,
    responder: Option<Responder>,
}

impl PolledTask {
    pub fn info(&self) -> &TaskInfo {
        &self.info
    }

    pub fn source(&self) -> TaskSource {
        self.source
    }

    pub fn into_info(self) -> TaskInfo {
        self.info
    }

    /// Responder for query / nexus tasks; `None` for ordinary tasks.
    pub fn take_responder(&mut self) -> Option<Responder> {
        self.responder.take()
    }
}

/// Completes a request task with its response.
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<serde_json::Value>,
}

impl Responder {
    /// Returns `false` if the requester is no longer waiting.
    pub fn respond(self, response: serde_json::Value) -> bool {
        self.tx.send(response).is_ok()
    }
}
