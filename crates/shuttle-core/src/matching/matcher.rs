//! Sync-match rendezvous.
//!
//! Two queues live under one mutex:
//! - `waiters`: poll attempts parked on a single-slot handoff, oldest first.
//! - `offers`: tasks whose sender is willing to block (backlog dispatch,
//!   query/nexus requests) until a poller shows up.
//!
//! Every handoff happens while holding the lock, so "who got the task" is decided
//! in exactly one place. A task is handed over by moving it into the waiter's
//! oneshot; the waiter then accepts it (see `Task::accept`). If the waiter has gone
//! away, the task is dropped with the oneshot and the offering side sees its
//! acceptance fail, then offers again. Nothing is lost and nothing is delivered twice.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use super::compat::{self, Compatibility};
use crate::domain::task::Acceptance;
use crate::domain::{MatchingError, PollerIdentity, PolledTask, Task};
use crate::ports::Clock;

struct Waiter {
    id: u64,
    identity: PollerIdentity,
    build_id: Option<String>,
    slot: oneshot::Sender<Task>,
}

struct Offer {
    id: u64,
    task: Task,
}

#[derive(Default)]
struct MatcherState {
    next_id: u64,
    waiters: VecDeque<Waiter>,
    offers: VecDeque<Offer>,
    closed: bool,
}

impl MatcherState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(idx) => {
                self.waiters.remove(idx);
                true
            }
            None => false,
        }
    }

    fn remove_offer(&mut self, id: u64) -> Option<Task> {
        let idx = self.offers.iter().position(|o| o.id == id)?;
        self.offers.remove(idx).map(|o| o.task)
    }
}

/// What happened to a task offered to the matcher.
#[derive(Debug)]
pub(crate) enum OfferOutcome {
    /// A poller accepted the task.
    Accepted,
    /// A poller took the task but vanished before accepting it. The task is gone;
    /// the offering side rebuilds it from its own copy of the `TaskInfo`.
    Lost,
    /// No compatible poller is waiting. The task is handed back.
    NoPoller(Task),
    /// The matcher is closed. The task is handed back.
    Closed(Task),
    /// The interrupt fired before any poller took the task.
    Interrupted(Task, MatchingError),
}

/// How a parked poll ended.
#[derive(Debug)]
pub(crate) enum PollOutcome {
    Task(PolledTask),
    DeadlineExceeded,
    UserDataChanged,
}

pub struct Matcher {
    state: Mutex<MatcherState>,
    clock: Arc<dyn Clock>,
}

impl Matcher {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MatcherState::default()),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MatcherState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of poll attempts currently parked.
    pub fn waiting_pollers(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Number of blocking offers (backlog tasks, requests) waiting for a poller.
    pub fn parked_offers(&self) -> usize {
        self.lock().offers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Hand `task` to the longest-waiting compatible poller, without blocking.
    ///
    /// Waiters whose poll was already torn down are skipped (and dropped).
    fn try_hand_off(&self, task: Task) -> Result<(), Task> {
        let now = self.clock.now();
        let mut state = self.lock();
        if state.closed {
            return Err(task);
        }
        let mut task = task;
        let mut idx = 0;
        while idx < state.waiters.len() {
            let waiter = &state.waiters[idx];
            if !compat::check(task.info(), waiter.build_id.as_deref(), now).is_match() {
                idx += 1;
                continue;
            }
            let Some(waiter) = state.waiters.remove(idx) else {
                break;
            };
            match waiter.slot.send(task) {
                Ok(()) => {
                    debug!(poller = %waiter.identity, "handed task to waiting poller");
                    return Ok(());
                }
                Err(returned) => {
                    debug!(poller = %waiter.identity, "waiting poller already gone, trying next");
                    task = returned;
                }
            }
        }
        Err(task)
    }

    /// Offer a task to a currently waiting poller. Never waits for a poller to arrive;
    /// waits only for the matched poller to accept.
    pub(crate) async fn offer(&self, task: Task, acceptance: Acceptance) -> OfferOutcome {
        match self.try_hand_off(task) {
            Ok(()) => match acceptance.await {
                Ok(()) => OfferOutcome::Accepted,
                Err(_) => OfferOutcome::Lost,
            },
            Err(task) if self.is_closed() => OfferOutcome::Closed(task),
            Err(task) => OfferOutcome::NoPoller(task),
        }
    }

    /// Offer a task and park it until a poller takes it or `interrupt` resolves.
    ///
    /// Whichever of {poller takes it, interrupt} wins the lock decides the outcome.
    pub(crate) async fn offer_blocking<F>(
        &self,
        task: Task,
        mut acceptance: Acceptance,
        interrupt: F,
    ) -> OfferOutcome
    where
        F: Future<Output = MatchingError>,
    {
        let task = match self.try_hand_off(task) {
            Ok(()) => {
                return match acceptance.await {
                    Ok(()) => OfferOutcome::Accepted,
                    Err(_) => OfferOutcome::Lost,
                };
            }
            Err(task) => task,
        };

        let offer_id = {
            let mut state = self.lock();
            if state.closed {
                return OfferOutcome::Closed(task);
            }
            let id = state.allocate_id();
            state.offers.push_back(Offer { id, task });
            id
        };

        let mut guard = OfferGuard {
            matcher: self,
            id: offer_id,
            armed: true,
        };

        tokio::select! {
            res = &mut acceptance => {
                guard.armed = false;
                match res {
                    Ok(()) => OfferOutcome::Accepted,
                    // Offer dropped without being taken: matcher closed.
                    Err(_) => OfferOutcome::Lost,
                }
            }
            reason = interrupt => {
                guard.armed = false;
                let reclaimed = self.lock().remove_offer(offer_id);
                match reclaimed {
                    Some(task) => OfferOutcome::Interrupted(task, reason),
                    // A poller took it between the interrupt and the lock; it accepts
                    // synchronously, so this resolves right away.
                    None => match acceptance.await {
                        Ok(()) => OfferOutcome::Accepted,
                        Err(_) => OfferOutcome::Lost,
                    },
                }
            }
        }
    }

    /// Take the best parked offer compatible with this poller: lowest priority
    /// level first, FIFO within a level.
    fn take_offer(
        state: &mut MatcherState,
        build_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<Task> {
        let idx = state
            .offers
            .iter()
            .enumerate()
            .filter(|(_, o)| compat::check(o.task.info(), build_id, now) == Compatibility::Match)
            .min_by_key(|(_, o)| (o.task.info().priority, o.id))
            .map(|(idx, _)| idx)?;
        state.offers.remove(idx).map(|o| o.task)
    }

    /// Park a poll attempt until a task arrives or one of the wake-ups fires.
    ///
    /// `deadline`, `cancelled` and `user_data_changed` race with task delivery; if a
    /// task was already handed over when one of them fires, the task wins.
    pub(crate) async fn poll<C, U>(
        &self,
        identity: &PollerIdentity,
        build_id: Option<&str>,
        deadline: Instant,
        cancelled: C,
        user_data_changed: U,
    ) -> Result<PollOutcome, MatchingError>
    where
        C: Future<Output = ()>,
        U: Future<Output = ()>,
    {
        let now = self.clock.now();
        let (mut slot, waiter_id) = {
            let mut state = self.lock();
            if state.closed {
                return Err(MatchingError::Unavailable);
            }
            if let Some(task) = Self::take_offer(&mut state, build_id, now) {
                drop(state);
                return Ok(PollOutcome::Task(task.accept()));
            }
            let (tx, rx) = oneshot::channel();
            let id = state.allocate_id();
            state.waiters.push_back(Waiter {
                id,
                identity: identity.clone(),
                build_id: build_id.map(str::to_string),
                slot: tx,
            });
            (rx, id)
        };

        let mut guard = WaiterGuard {
            matcher: self,
            id: waiter_id,
            armed: true,
        };

        let woke = tokio::select! {
            res = &mut slot => {
                guard.armed = false;
                return match res {
                    Ok(task) => Ok(PollOutcome::Task(task.accept())),
                    Err(_) => Err(MatchingError::Unavailable),
                };
            }
            _ = tokio::time::sleep_until(deadline) => Ok(PollOutcome::DeadlineExceeded),
            _ = cancelled => Err(MatchingError::Cancelled),
            _ = user_data_changed => Ok(PollOutcome::UserDataChanged),
        };

        guard.armed = false;
        if self.lock().remove_waiter(waiter_id) {
            return woke;
        }
        // Someone removed us: either a task was sent, or the matcher closed.
        match slot.try_recv() {
            Ok(task) => Ok(PollOutcome::Task(task.accept())),
            Err(_) => Err(MatchingError::Unavailable),
        }
    }

    /// Refuse new work and release everything parked.
    ///
    /// Parked pollers see `Unavailable`; parked offers see their acceptance fail.
    pub fn close(&self) {
        let (waiters, offers) = {
            let mut state = self.lock();
            state.closed = true;
            (
                std::mem::take(&mut state.waiters),
                std::mem::take(&mut state.offers),
            )
        };
        debug!(
            waiters = waiters.len(),
            offers = offers.len(),
            "matcher closed"
        );
        drop(waiters);
        drop(offers);
    }
}

/// Removes a parked waiter if the poll future is dropped mid-wait.
struct WaiterGuard<'a> {
    matcher: &'a Matcher,
    id: u64,
    armed: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.matcher.lock().remove_waiter(self.id);
        }
    }
}

/// Pulls a parked offer back out if the offering future is dropped mid-wait.
struct OfferGuard<'a> {
    matcher: &'a Matcher,
    id: u64,
    armed: bool,
}

impl Drop for OfferGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.matcher.lock().remove_offer(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NamespaceId, Priority, TaskId, TaskInfo, TaskSource, VersioningTag};
    use crate::ports::SystemClock;
    use std::future::pending;
    use std::time::Duration;
    use ulid::Ulid;

    fn matcher() -> Arc<Matcher> {
        Arc::new(Matcher::new(Arc::new(SystemClock)))
    }

    fn info() -> TaskInfo {
        TaskInfo::new(
            TaskId::from_ulid(Ulid::new()),
            NamespaceId::new("ns"),
            serde_json::json!({}),
            Utc::now(),
        )
    }

    fn spawn_poller(
        m: &Arc<Matcher>,
        name: &str,
        build_id: Option<&'static str>,
        wait: Duration,
    ) -> tokio::task::JoinHandle<Result<PollOutcome, MatchingError>> {
        let m = Arc::clone(m);
        let identity = PollerIdentity::new(name);
        tokio::spawn(async move {
            m.poll(
                &identity,
                build_id,
                Instant::now() + wait,
                pending(),
                pending(),
            )
            .await
        })
    }

    async fn wait_for_waiters(m: &Matcher, n: usize) {
        while m.waiting_pollers() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn offer_without_waiter_returns_immediately() {
        let m = matcher();
        let (task, acc) = Task::in_flight(info(), TaskSource::SyncMatch);
        let outcome = m.offer(task, acc).await;
        assert!(matches!(outcome, OfferOutcome::NoPoller(_)));
    }

    #[tokio::test]
    async fn longest_waiting_poller_wins() {
        let m = matcher();
        let p1 = spawn_poller(&m, "p1", None, Duration::from_secs(5));
        wait_for_waiters(&m, 1).await;
        let p2 = spawn_poller(&m, "p2", None, Duration::from_millis(200));
        wait_for_waiters(&m, 2).await;

        let (task, acc) = Task::in_flight(info(), TaskSource::SyncMatch);
        let task_id = task.info().task_id;
        assert!(matches!(m.offer(task, acc).await, OfferOutcome::Accepted));

        match p1.await.unwrap().unwrap() {
            PollOutcome::Task(t) => assert_eq!(t.info().task_id, task_id),
            other => panic!("p1 expected a task, got {other:?}"),
        }
        assert!(matches!(
            p2.await.unwrap().unwrap(),
            PollOutcome::DeadlineExceeded
        ));
    }

    #[tokio::test]
    async fn future_visible_tasks_are_not_sync_matched() {
        let m = matcher();
        let _p = spawn_poller(&m, "p", None, Duration::from_secs(5));
        wait_for_waiters(&m, 1).await;

        let later = info().with_visible_at(Utc::now() + chrono::Duration::seconds(60));
        let (task, acc) = Task::in_flight(later, TaskSource::SyncMatch);
        assert!(matches!(m.offer(task, acc).await, OfferOutcome::NoPoller(_)));
        assert_eq!(m.waiting_pollers(), 1);
    }

    #[tokio::test]
    async fn pinned_task_skips_incompatible_waiter() {
        let m = matcher();
        let p_old = spawn_poller(&m, "old", Some("b1"), Duration::from_millis(200));
        wait_for_waiters(&m, 1).await;
        let p_new = spawn_poller(&m, "new", Some("b2"), Duration::from_secs(5));
        wait_for_waiters(&m, 2).await;

        let pinned = info().with_versioning(VersioningTag::Pinned("b2".into()));
        let (task, acc) = Task::in_flight(pinned, TaskSource::SyncMatch);
        assert!(matches!(m.offer(task, acc).await, OfferOutcome::Accepted));
        assert!(matches!(
            p_new.await.unwrap().unwrap(),
            PollOutcome::Task(_)
        ));
        assert!(matches!(
            p_old.await.unwrap().unwrap(),
            PollOutcome::DeadlineExceeded
        ));
    }

    #[tokio::test]
    async fn dropped_poller_is_removed_from_waiters() {
        let m = matcher();
        let p = spawn_poller(&m, "p", None, Duration::from_secs(5));
        wait_for_waiters(&m, 1).await;
        p.abort();
        let _ = p.await;
        assert_eq!(m.waiting_pollers(), 0);

        let (task, acc) = Task::in_flight(info(), TaskSource::SyncMatch);
        assert!(matches!(m.offer(task, acc).await, OfferOutcome::NoPoller(_)));
    }

    #[tokio::test]
    async fn parked_offer_goes_to_next_poller() {
        let m = matcher();
        let (task, acc) = Task::in_flight(info(), TaskSource::SyncMatch);
        let offering = {
            let m = Arc::clone(&m);
            tokio::spawn(async move { m.offer_blocking(task, acc, pending()).await })
        };
        while m.parked_offers() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let p = spawn_poller(&m, "p", None, Duration::from_secs(5));
        assert!(matches!(p.await.unwrap().unwrap(), PollOutcome::Task(_)));
        assert!(matches!(offering.await.unwrap(), OfferOutcome::Accepted));
    }

    #[tokio::test]
    async fn interrupted_offer_hands_the_task_back() {
        let m = matcher();
        let (task, acc) = Task::in_flight(info(), TaskSource::SyncMatch);
        let outcome = m
            .offer_blocking(task, acc, async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                MatchingError::Cancelled
            })
            .await;
        assert!(matches!(
            outcome,
            OfferOutcome::Interrupted(_, MatchingError::Cancelled)
        ));
        assert_eq!(m.parked_offers(), 0);
    }

    #[tokio::test]
    async fn parked_offers_are_taken_by_priority() {
        let m = matcher();
        let mut offering = Vec::new();
        for level in [5u8, 1, 3] {
            let (task, acc) = Task::in_flight(
                info().with_priority(Priority::new(level)),
                TaskSource::SyncMatch,
            );
            let m = Arc::clone(&m);
            offering.push(tokio::spawn(async move {
                m.offer_blocking(task, acc, pending()).await
            }));
        }
        while m.parked_offers() < 3 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let mut levels = Vec::new();
        for _ in 0..3 {
            match spawn_poller(&m, "p", None, Duration::from_secs(1)).await.unwrap().unwrap() {
                PollOutcome::Task(t) => levels.push(t.info().priority.level()),
                other => panic!("expected task, got {other:?}"),
            }
        }
        assert_eq!(levels, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn close_releases_everyone() {
        let m = matcher();
        let p = spawn_poller(&m, "p", None, Duration::from_secs(5));
        wait_for_waiters(&m, 1).await;
        m.close();
        assert!(matches!(p.await.unwrap(), Err(MatchingError::Unavailable)));

        let (task, acc) = Task::in_flight(info(), TaskSource::SyncMatch);
        assert!(matches!(
            m.offer_blocking(task, acc, pending()).await,
            OfferOutcome::Closed(_)
        ));
    }
}
