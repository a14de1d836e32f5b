//! Poller identity and per-poll metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PollerIdentity(String);

impl PollerIdentity {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PollerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Metadata attached to one long-poll call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollMetadata {
    pub identity: PollerIdentity,
    /// How long the poll may wait. `None` falls back to the partition default.
    pub timeout: Option<Duration>,
    /// Build the worker runs; pinned tasks only go to matching builds.
    pub build_id: Option<String>,
    /// Slots the worker reports as free. Used as a capacity hint only.
    pub capacity: Option<u32>,
}

impl PollMetadata {
    pub fn new(identity: PollerIdentity) -> Self {
        Self {
            identity,
            timeout: None,
            build_id: None,
            capacity: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_build_id(mut self, build_id: impl Into<String>) -> Self {
        self.build_id = Some(build_id.into());
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// Snapshot of a registered poller, as returned by diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerInfo {
    pub identity: PollerIdentity,
    pub last_access_time: DateTime<Utc>,
    pub capacity: Option<u32>,
    pub build_id: Option<String>,
}
