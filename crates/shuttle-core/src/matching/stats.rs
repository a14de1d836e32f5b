//! Diagnostics snapshots: stats, internal status, describe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::lifecycle::PartitionState;
use crate::domain::{PollerInfo, SequenceId, UnloadCause};

/// Monotonic per-partition counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    sync_matched: AtomicU64,
    spooled: AtomicU64,
    backlog_dispatched: AtomicU64,
    expired: AtomicU64,
    requests_answered: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    SyncMatched,
    Spooled,
    BacklogDispatched,
    Expired,
    RequestsAnswered,
}

impl Counters {
    pub(crate) fn incr(&self, counter: Counter) {
        let cell = match counter {
            Counter::SyncMatched => &self.sync_matched,
            Counter::Spooled => &self.spooled,
            Counter::BacklogDispatched => &self.backlog_dispatched,
            Counter::Expired => &self.expired,
            Counter::RequestsAnswered => &self.requests_answered,
        };
        cell.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            sync_matched: self.sync_matched.load(Ordering::Relaxed),
            spooled: self.spooled.load(Ordering::Relaxed),
            backlog_dispatched: self.backlog_dispatched.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            requests_answered: self.requests_answered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub sync_matched: u64,
    pub spooled: u64,
    pub backlog_dispatched: u64,
    pub expired: u64,
    pub requests_answered: u64,
}

/// Public stats for one partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub approximate_backlog_count: u64,
    /// Age of the oldest unacked backlog task.
    #[serde(with = "super::config::millis")]
    pub approximate_backlog_age: Duration,
    pub waiting_pollers: usize,
    pub counters: CounterSnapshot,
}

/// Operator-facing internal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalTaskQueueStatus {
    pub queue_key: String,
    pub instance: u64,
    pub state: PartitionState,
    /// Cursor of the backlog reader.
    pub read_level: SequenceId,
    pub outstanding_dispatches: usize,
    pub waiting_pollers: usize,
    pub parked_offers: usize,
    pub approximate_backlog_count: u64,
    pub unload_cause: Option<UnloadCause>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescribeResponse {
    pub pollers: Vec<PollerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<InternalTaskQueueStatus>,
}
