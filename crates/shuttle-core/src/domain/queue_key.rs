//! Physical queue identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of work a task queue carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskQueueKind {
    Workflow,
    Activity,
    Nexus,
}

impl TaskQueueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskQueueKind::Workflow => "workflow",
            TaskQueueKind::Activity => "activity",
            TaskQueueKind::Nexus => "nexus",
        }
    }
}

impl fmt::Display for TaskQueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable identity of one partition of a task queue.
///
/// Every per-partition structure (backlog rows, pollers, lifecycle) is keyed by this.
/// Fields are private so a key can't be mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueKey {
    name: String,
    kind: TaskQueueKind,
    partition: u32,
}

impl QueueKey {
    pub fn new(name: impl Into<String>, kind: TaskQueueKind, partition: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            partition,
        }
    }

    /// Partition 0 of the queue.
    pub fn root(name: impl Into<String>, kind: TaskQueueKind) -> Self {
        Self::new(name, kind, 0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TaskQueueKind {
        self.kind
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn is_root(&self) -> bool {
        self.partition == 0
    }
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.name, self.kind, self.partition)
    }
}
