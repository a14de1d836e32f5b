//! Backlog port - spool された task の永続ストア
//!
//! Backlog は queue key ごとの順序付きストアです。
//!
//! # 設計原則
//! - append 時に `SequenceId` を払い出す（queue key ごとに単調増加）
//! - read_next はカーソル以降の最初の未 ack エントリを返す（削除しない）
//! - ack されるまでエントリは残る → 配送前にクラッシュしても再配送できる（at-least-once）
//! - パーティションはカーソルだけを持ち、エントリの所有権は backlog 側にある

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{QueueKey, SequenceId, TaskInfo};

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BacklogError {
    /// Transient I/O failure; the caller may retry.
    #[error("backlog unavailable: {0}")]
    Unavailable(String),

    /// Another owner took the queue; writes from this partition are fenced.
    #[error("backlog ownership lost")]
    OwnershipLost,

    #[error("no backlog entry {0}")]
    NotFound(SequenceId),
}

/// One entry read back from the backlog.
#[derive(Debug, Clone, PartialEq)]
pub struct BacklogEntry {
    pub seq: SequenceId,
    pub task: TaskInfo,
    /// Cursor to pass to the next `read_next` call.
    pub next_cursor: SequenceId,
}

/// Size of one queue's backlog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BacklogStats {
    pub len: u64,
    pub oldest_created_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait Backlog: Send + Sync {
    /// Durably append a task and return its sequence id.
    async fn append(&self, key: &QueueKey, task: TaskInfo) -> Result<SequenceId, BacklogError>;

    /// First unacked entry with `seq >= cursor`, if any.
    async fn read_next(
        &self,
        key: &QueueKey,
        cursor: SequenceId,
    ) -> Result<Option<BacklogEntry>, BacklogError>;

    /// Remove a delivered entry.
    async fn ack(&self, key: &QueueKey, seq: SequenceId) -> Result<(), BacklogError>;

    async fn stats(&self, key: &QueueKey) -> Result<BacklogStats, BacklogError>;
}
