//! Spool bridge: backlog writes, the backlog reader, and spooled-task dispatch.
//!
//! The reader walks the backlog with a cursor and hands each entry to its own
//! dispatch task. At most `max_outstanding_dispatches` entries are read but not yet
//! acked at any time. An entry is acked only after a poller accepted it (or it
//! expired); a dispatch that gives up while the partition is still running rewinds
//! the cursor so the entry is read again.
//!
//! Entries that are not visible yet take no dispatch slot. The reader skips them,
//! remembers the earliest one, and rewinds to it once it is due.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::matcher::OfferOutcome;
use super::partition::{sleep_until_opt, Partition};
use super::stats::Counter;
use crate::domain::{MatchingError, SequenceId, Task, TaskInfo, TaskSource, UnloadCause};
use crate::ports::{BacklogEntry, BacklogError};

pub(super) struct SpoolState {
    wake: Notify,
    permits: Arc<Semaphore>,
    max_outstanding: usize,
    read_level: AtomicU64,
    approx_len: AtomicU64,
    claims: Mutex<Claims>,
    /// Lowest sequence id the reader has to go back to.
    rewind: Mutex<Option<SequenceId>>,
    deferred: Mutex<Option<Deferred>>,
}

#[derive(Debug, Default)]
struct Claims {
    /// Entries currently owned by a dispatch task.
    in_flight: BTreeSet<SequenceId>,
    /// Entries acked since the reader's current `read_next` began.
    completed: BTreeSet<SequenceId>,
}

/// Skipped not-yet-visible entries, folded into one rewind point.
#[derive(Debug, Clone, Copy)]
struct Deferred {
    from: SequenceId,
    due: DateTime<Utc>,
}

impl SpoolState {
    pub(super) fn new(max_outstanding: usize) -> Self {
        Self {
            wake: Notify::new(),
            permits: Arc::new(Semaphore::new(max_outstanding)),
            max_outstanding,
            read_level: AtomicU64::new(0),
            approx_len: AtomicU64::new(0),
            claims: Mutex::new(Claims::default()),
            rewind: Mutex::new(None),
            deferred: Mutex::new(None),
        }
    }

    pub(super) fn outstanding(&self) -> usize {
        self.max_outstanding
            .saturating_sub(self.permits.available_permits())
    }

    pub(super) fn read_level(&self) -> SequenceId {
        SequenceId::new(self.read_level.load(Ordering::Relaxed))
    }

    pub(super) fn approx_len(&self) -> u64 {
        self.approx_len.load(Ordering::Relaxed)
    }

    pub(super) fn set_approx_len(&self, len: u64) {
        self.approx_len.store(len, Ordering::Relaxed);
    }

    fn note_removed(&self) {
        let _ = self
            .approx_len
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    fn claims(&self) -> std::sync::MutexGuard<'_, Claims> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `false` if the entry is already being dispatched, or was acked
    /// after the reader fetched it.
    fn claim(&self, seq: SequenceId) -> bool {
        let mut claims = self.claims();
        !claims.completed.contains(&seq) && claims.in_flight.insert(seq)
    }

    fn release(&self, seq: SequenceId) {
        self.claims().in_flight.remove(&seq);
    }

    fn mark_completed(&self, seq: SequenceId) {
        self.claims().completed.insert(seq);
    }

    /// Acks older than the next read can't show up in it.
    fn forget_completed(&self) {
        self.claims().completed.clear();
    }

    fn request_rewind(&self, seq: SequenceId) {
        let mut rewind = self.rewind.lock().unwrap_or_else(|e| e.into_inner());
        *rewind = Some(rewind.map_or(seq, |r| r.min(seq)));
    }

    fn take_rewind(&self) -> Option<SequenceId> {
        self.rewind.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn defer(&self, seq: SequenceId, visible_at: DateTime<Utc>) {
        let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
        *deferred = Some(match *deferred {
            None => Deferred { from: seq, due: visible_at },
            Some(d) => Deferred {
                from: d.from.min(seq),
                due: d.due.min(visible_at),
            },
        });
    }

    /// Rewind point of the deferred entries, once the earliest of them is visible.
    fn take_due(&self, now: DateTime<Utc>) -> Option<SequenceId> {
        let mut deferred = self.deferred.lock().unwrap_or_else(|e| e.into_inner());
        match *deferred {
            Some(d) if d.due <= now => {
                *deferred = None;
                Some(d.from)
            }
            _ => None,
        }
    }

    fn next_due(&self) -> Option<DateTime<Utc>> {
        let deferred = *self.deferred.lock().unwrap_or_else(|e| e.into_inner());
        deferred.map(|d| d.due)
    }
}

impl Partition {
    /// Persist a task to the backlog and wake the reader.
    ///
    /// Failures go back to the caller; nothing is retried here. Losing backlog
    /// ownership unloads the partition.
    pub async fn spool_task(&self, info: TaskInfo) -> Result<SequenceId, MatchingError> {
        self.lifecycle.ensure_running()?;
        let task_id = info.task_id;
        let seq = self
            .backlog
            .append(&self.key, info)
            .await
            .map_err(|e| self.backlog_failed(e))?;
        self.spool.approx_len.fetch_add(1, Ordering::Relaxed);
        self.counters.incr(Counter::Spooled);
        self.mark_alive();
        self.spool.wake.notify_one();
        debug!(queue = %self.key, %task_id, %seq, "task spooled");
        Ok(seq)
    }

    /// Queue a backlog entry for dispatch. Waits for a free dispatch slot.
    ///
    /// An entry that is not visible yet is left to the reader, which picks it up
    /// again once it is due.
    pub async fn add_spooled_task(self: &Arc<Self>, entry: BacklogEntry) -> Result<(), MatchingError> {
        self.lifecycle.ensure_running()?;
        if self.defer_if_hidden(&entry) {
            self.spool.wake.notify_one();
            return Ok(());
        }
        let permit = tokio::select! {
            biased;
            _ = self.lifecycle.shutdown_token().cancelled() => return Err(MatchingError::Unavailable),
            permit = Arc::clone(&self.spool.permits).acquire_owned() => {
                permit.map_err(|_| MatchingError::Unavailable)?
            }
        };
        if self.spool.claim(entry.seq) {
            self.spawn_dispatch(entry, permit);
        }
        Ok(())
    }

    /// Offer a backlog entry to a poller that is already waiting. Acks on success.
    pub async fn add_spooled_task_to_matcher(&self, entry: &BacklogEntry) -> Result<bool, MatchingError> {
        loop {
            let (task, acceptance) = Task::in_flight(entry.task.clone(), TaskSource::Backlog(entry.seq));
            match self.matcher.offer(task, acceptance).await {
                OfferOutcome::Accepted => {
                    self.complete_spooled(entry).await;
                    return Ok(true);
                }
                OfferOutcome::Lost => continue,
                OfferOutcome::NoPoller(_) => return Ok(false),
                OfferOutcome::Closed(_) => return Err(MatchingError::Unavailable),
                OfferOutcome::Interrupted(_, err) => return Err(err),
            }
        }
    }

    /// Park a backlog entry until a poller takes it.
    ///
    /// Interrupted by `cancel`, partition shutdown, a user-data change
    /// (`UserDataChanged`) or the task's expiry (`DeadlineExceeded`). Acks once a
    /// poller accepted the task.
    pub async fn dispatch_spooled_task(
        &self,
        cancel: &CancellationToken,
        entry: &BacklogEntry,
        user_data_changed: &mut watch::Receiver<u64>,
    ) -> Result<(), MatchingError> {
        self.lifecycle.ensure_running()?;
        let shutdown = self.lifecycle.shutdown_token();
        let expiry = entry.task.expires_at.map(|at| self.instant_at(at));
        loop {
            let (task, acceptance) = Task::in_flight(entry.task.clone(), TaskSource::Backlog(entry.seq));
            let interrupt = async {
                tokio::select! {
                    _ = cancel.cancelled() => MatchingError::Cancelled,
                    _ = shutdown.cancelled() => MatchingError::Unavailable,
                    _ = sleep_until_opt(expiry) => MatchingError::DeadlineExceeded,
                    res = user_data_changed.changed() => match res {
                        Ok(()) => MatchingError::UserDataChanged,
                        Err(_) => std::future::pending::<MatchingError>().await,
                    },
                }
            };
            match self.matcher.offer_blocking(task, acceptance, interrupt).await {
                OfferOutcome::Accepted => {
                    self.complete_spooled(entry).await;
                    return Ok(());
                }
                OfferOutcome::Lost => {
                    debug!(queue = %self.key, seq = %entry.seq, "poller vanished before accepting, re-offering");
                }
                OfferOutcome::NoPoller(_) | OfferOutcome::Closed(_) => {
                    return Err(MatchingError::Unavailable);
                }
                OfferOutcome::Interrupted(_, err) => return Err(err),
            }
        }
    }

    /// Drive one backlog entry to completion: skip it if expired, wait until it is
    /// visible, then sync-match or park it.
    pub async fn process_spooled_task(
        &self,
        cancel: &CancellationToken,
        entry: &BacklogEntry,
    ) -> Result<(), MatchingError> {
        loop {
            self.lifecycle.ensure_running()?;
            let now = self.clock.now();
            if entry.task.is_expired(now) {
                self.expire_spooled(entry).await;
                return Ok(());
            }
            if !entry.task.is_visible(now) {
                let wait = (entry.task.visible_at - now)
                    .to_std()
                    .unwrap_or_default()
                    .min(self.config.backlog_recheck_interval);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => continue,
                    _ = cancel.cancelled() => return Err(MatchingError::Cancelled),
                    _ = self.lifecycle.shutdown_token().cancelled() => return Err(MatchingError::Unavailable),
                }
            }
            if self.add_spooled_task_to_matcher(entry).await? {
                return Ok(());
            }
            let mut user_data = self.user_data.subscribe();
            match self.dispatch_spooled_task(cancel, entry, &mut user_data).await {
                Err(MatchingError::UserDataChanged) | Err(MatchingError::DeadlineExceeded) => {
                    debug!(queue = %self.key, seq = %entry.seq, "re-validating spooled task");
                }
                other => return other,
            }
        }
    }

    /// Returns `true` if the entry was deferred instead of dispatched. Expired
    /// entries are never deferred so they get acked.
    fn defer_if_hidden(&self, entry: &BacklogEntry) -> bool {
        let now = self.clock.now();
        if entry.task.is_expired(now) || entry.task.is_visible(now) {
            return false;
        }
        self.spool.defer(entry.seq, entry.task.visible_at);
        debug!(queue = %self.key, seq = %entry.seq, visible_at = %entry.task.visible_at, "task not visible yet, deferred");
        true
    }

    /// How long the idle reader sleeps before looking at the backlog again.
    fn idle_wait(&self) -> Duration {
        let recheck = self.config.backlog_recheck_interval;
        match self.spool.next_due() {
            Some(due) => (due - self.clock.now())
                .to_std()
                .unwrap_or_default()
                .min(recheck),
            None => recheck,
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, entry: BacklogEntry, permit: OwnedSemaphorePermit) {
        let partition = Arc::clone(self);
        tokio::spawn(async move {
            let cancel = partition.lifecycle.shutdown_token().clone();
            let result = partition.process_spooled_task(&cancel, &entry).await;
            if let Err(err) = result {
                if partition.lifecycle.state().is_terminating() {
                    debug!(queue = %partition.key, seq = %entry.seq, "dispatch abandoned, partition stopping");
                } else {
                    warn!(
                        queue = %partition.key,
                        seq = %entry.seq,
                        error = %err,
                        "spooled task not delivered, re-reading"
                    );
                    partition.spool.request_rewind(entry.seq);
                    partition.spool.wake.notify_one();
                }
            }
            partition.spool.release(entry.seq);
            drop(permit);
        });
    }

    async fn complete_spooled(&self, entry: &BacklogEntry) {
        self.counters.incr(Counter::BacklogDispatched);
        self.ack(entry.seq).await;
    }

    async fn expire_spooled(&self, entry: &BacklogEntry) {
        debug!(queue = %self.key, seq = %entry.seq, task_id = %entry.task.task_id, "dropping expired task");
        self.counters.incr(Counter::Expired);
        self.ack(entry.seq).await;
    }

    /// The task is already delivered (or dropped) when this runs, so a failed ack
    /// only means the entry may be delivered again by a later owner.
    async fn ack(&self, seq: SequenceId) {
        match self.backlog.ack(&self.key, seq).await {
            Ok(()) => {
                self.spool.note_removed();
                self.spool.mark_completed(seq);
            }
            Err(BacklogError::NotFound(_)) => self.spool.mark_completed(seq),
            Err(err) => {
                warn!(queue = %self.key, %seq, error = %err, "backlog ack failed");
                let _ = self.backlog_failed(err);
            }
        }
    }

    fn backlog_failed(&self, err: BacklogError) -> MatchingError {
        if matches!(err, BacklogError::OwnershipLost) {
            self.unload_from_partition_manager(UnloadCause::OwnershipLost);
        }
        MatchingError::Backlog(err)
    }

    pub(super) async fn run_reader(self: Arc<Self>) {
        let shutdown = self.lifecycle.shutdown_token().clone();
        match self.backlog.stats(&self.key).await {
            Ok(stats) => self.spool.set_approx_len(stats.len),
            Err(err) => debug!(queue = %self.key, error = %err, "backlog stats unavailable"),
        }
        debug!(queue = %self.key, "backlog reader started");

        let mut cursor = SequenceId::ZERO;
        loop {
            if let Some(seq) = self.spool.take_rewind() {
                cursor = cursor.min(seq);
            }
            if let Some(seq) = self.spool.take_due(self.clock.now()) {
                cursor = cursor.min(seq);
            }
            let permit = tokio::select! {
                permit = Arc::clone(&self.spool.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            };
            self.spool.forget_completed();
            let read = tokio::select! {
                read = self.backlog.read_next(&self.key, cursor) => read,
                _ = shutdown.cancelled() => break,
            };
            match read {
                Ok(Some(entry)) => {
                    cursor = entry.next_cursor;
                    self.spool.read_level.store(cursor.get(), Ordering::Relaxed);
                    if self.defer_if_hidden(&entry) {
                        continue;
                    }
                    if self.spool.claim(entry.seq) {
                        self.spawn_dispatch(entry, permit);
                    }
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = self.spool.wake.notified() => {}
                        _ = tokio::time::sleep(self.idle_wait()) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                Err(BacklogError::OwnershipLost) => {
                    warn!(queue = %self.key, "backlog ownership lost");
                    self.unload_from_partition_manager(UnloadCause::OwnershipLost);
                    break;
                }
                Err(err) => {
                    drop(permit);
                    warn!(queue = %self.key, error = %err, "backlog read failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.backlog_recheck_interval) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }
        debug!(queue = %self.key, "backlog reader stopped");
    }
}
