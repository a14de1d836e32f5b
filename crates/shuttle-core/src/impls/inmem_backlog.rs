//! InMemoryBacklog - 開発・テスト用の backlog
//!
//! # 実装詳細
//! - queue key ごとに `BTreeMap<SequenceId, TaskInfo>` を持つ
//! - std の Mutex で排他制御（await を跨がないので async Mutex は不要）
//! - `fence` で OwnershipLost、`fail_next` で一時障害を注入できる

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::domain::{QueueKey, SequenceId, TaskInfo};
use crate::ports::{Backlog, BacklogEntry, BacklogError, BacklogStats};

#[derive(Default)]
struct QueueRows {
    /// Last assigned sequence id.
    last_seq: u64,
    rows: BTreeMap<SequenceId, TaskInfo>,
    fenced: bool,
}

#[derive(Default)]
struct BacklogState {
    queues: HashMap<QueueKey, QueueRows>,
    /// Number of upcoming operations that fail with `Unavailable`.
    injected_failures: u32,
}

pub struct InMemoryBacklog {
    state: Mutex<BacklogState>,
}

impl InMemoryBacklog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BacklogState::default()),
        }
    }

    /// Make every later operation on `key` fail with `OwnershipLost`.
    pub fn fence(&self, key: &QueueKey) {
        let mut state = self.lock();
        state.queues.entry(key.clone()).or_default().fenced = true;
    }

    /// Lift a previous `fence`, as if ownership had been re-acquired.
    pub fn unfence(&self, key: &QueueKey) {
        if let Some(queue) = self.lock().queues.get_mut(key) {
            queue.fenced = false;
        }
    }

    /// Fail the next `n` operations (any key) with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.lock().injected_failures = n;
    }

    /// Snapshot of the unacked tasks of `key`, in sequence order.
    pub fn pending(&self, key: &QueueKey) -> Vec<(SequenceId, TaskInfo)> {
        self.lock()
            .queues
            .get(key)
            .map(|q| q.rows.iter().map(|(s, t)| (*s, t.clone())).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BacklogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(state: &mut BacklogState, key: &QueueKey) -> Result<(), BacklogError> {
        if state.injected_failures > 0 {
            state.injected_failures -= 1;
            return Err(BacklogError::Unavailable("injected failure".to_string()));
        }
        if state.queues.get(key).is_some_and(|q| q.fenced) {
            return Err(BacklogError::OwnershipLost);
        }
        Ok(())
    }
}

impl Default for InMemoryBacklog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backlog for InMemoryBacklog {
    async fn append(&self, key: &QueueKey, task: TaskInfo) -> Result<SequenceId, BacklogError> {
        let mut state = self.lock();
        Self::check(&mut state, key)?;
        let queue = state.queues.entry(key.clone()).or_default();
        queue.last_seq += 1;
        let seq = SequenceId::new(queue.last_seq);
        queue.rows.insert(seq, task);
        Ok(seq)
    }

    async fn read_next(
        &self,
        key: &QueueKey,
        cursor: SequenceId,
    ) -> Result<Option<BacklogEntry>, BacklogError> {
        let mut state = self.lock();
        Self::check(&mut state, key)?;
        let entry = state.queues.get(key).and_then(|q| {
            q.rows.range(cursor..).next().map(|(seq, task)| BacklogEntry {
                seq: *seq,
                task: task.clone(),
                next_cursor: seq.next(),
            })
        });
        Ok(entry)
    }

    async fn ack(&self, key: &QueueKey, seq: SequenceId) -> Result<(), BacklogError> {
        let mut state = self.lock();
        Self::check(&mut state, key)?;
        state
            .queues
            .get_mut(key)
            .and_then(|q| q.rows.remove(&seq))
            .map(|_| ())
            .ok_or(BacklogError::NotFound(seq))
    }

    async fn stats(&self, key: &QueueKey) -> Result<BacklogStats, BacklogError> {
        let state = self.lock();
        let stats = state
            .queues
            .get(key)
            .map(|q| BacklogStats {
                len: q.rows.len() as u64,
                oldest_created_at: q.rows.values().map(|t| t.created_at).min(),
            })
            .unwrap_or_default();
        Ok(stats)
    }
}
