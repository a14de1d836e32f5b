//! Partition - 1 つの task queue パーティション
//!
//! Rendezvous（`Matcher`）、spool bridge、poller registry、scaling advisor、
//! lifecycle をまとめたものです。
//!
//! # フロー
//! 1. producer: `try_sync_match` → 待機中 poller がいなければ `spool_task`
//! 2. reader: backlog を `read_next` → `process_spooled_task` → ack
//! 3. worker: `poll_task` で task を受け取る
//!
//! # 不変条件
//! - task は 1 回の poll にしか渡らない（acceptance シグナルで確認）
//! - spool された task は ack されるまで backlog に残る（at-least-once）
//! - `Stopping` 以降は全ての入口が `Unavailable` を返す

use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::{ConfigError, MatchingConfig};
use super::lifecycle::{Lifecycle, PartitionState};
use super::matcher::{Matcher, OfferOutcome, PollOutcome};
use super::registry::PollerRegistry;
use super::scaling::{ScalingAdvisor, ScalingBounds, ScalingDecision};
use super::spool::SpoolState;
use super::stats::{Counter, Counters, DescribeResponse, InternalTaskQueueStatus, QueueStats};
use crate::domain::{
    MatchingError, PollMetadata, PolledTask, PollerInfo, QueueKey, RequestId, RequestKind,
    SequenceId, Task, TaskInfo, TaskSource, UnloadCause,
};
use crate::ports::{Backlog, Clock, IdGenerator, PartitionOwner, SystemClock, UlidGenerator};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Where an added task ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddTaskOutcome {
    SyncMatched,
    Spooled(SequenceId),
}

/// Builds a `Partition`. Validates the config up front.
///
/// # 使用例
/// ```ignore
/// let partition = Partition::builder(QueueKey::root("orders", TaskQueueKind::Activity), backlog)
///     .config(config)
///     .owner(Arc::downgrade(&manager) as Weak<dyn PartitionOwner>)
///     .build()?;
/// partition.start()?;
/// ```
pub struct PartitionBuilder {
    key: QueueKey,
    backlog: Arc<dyn Backlog>,
    config: MatchingConfig,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    owner: Option<Weak<dyn PartitionOwner>>,
}

impl PartitionBuilder {
    pub fn config(mut self, config: MatchingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Owner notified once when the partition has stopped.
    pub fn owner(mut self, owner: Weak<dyn PartitionOwner>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn build(self) -> Result<Arc<Partition>, ConfigError> {
        self.config.validate()?;
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&self.clock))));
        let (user_data, _) = watch::channel(0u64);
        Ok(Arc::new(Partition {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            matcher: Matcher::new(Arc::clone(&self.clock)),
            registry: PollerRegistry::new(self.config.poller_history_ttl, Arc::clone(&self.clock)),
            advisor: ScalingAdvisor::new(ScalingBounds::from(&self.config)),
            lifecycle: Lifecycle::new(),
            spool: SpoolState::new(self.config.max_outstanding_dispatches),
            counters: Counters::default(),
            user_data,
            key: self.key,
            backlog: self.backlog,
            config: self.config,
            clock: self.clock,
            ids,
            owner: self.owner,
        }))
    }
}

pub struct Partition {
    pub(super) key: QueueKey,
    pub(super) instance: u64,
    pub(super) config: MatchingConfig,
    pub(super) clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    pub(super) backlog: Arc<dyn Backlog>,
    pub(super) matcher: Matcher,
    registry: PollerRegistry,
    advisor: ScalingAdvisor,
    pub(super) lifecycle: Lifecycle,
    pub(super) spool: SpoolState,
    pub(super) counters: Counters,
    /// Bumped on every routing/versioning data change.
    pub(super) user_data: watch::Sender<u64>,
    owner: Option<Weak<dyn PartitionOwner>>,
}

impl Partition {
    pub fn builder(key: QueueKey, backlog: Arc<dyn Backlog>) -> PartitionBuilder {
        PartitionBuilder {
            key,
            backlog,
            config: MatchingConfig::default(),
            clock: Arc::new(SystemClock),
            ids: None,
            owner: None,
        }
    }

    pub fn queue_key(&self) -> &QueueKey {
        &self.key
    }

    /// Distinguishes successive partitions loaded for the same key.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn state(&self) -> PartitionState {
        self.lifecycle.state()
    }

    pub fn unload_cause(&self) -> Option<UnloadCause> {
        self.lifecycle.cause()
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn id_generator(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    /// Start the partition and its backlog reader. Must run inside a tokio runtime.
    ///
    /// Calling it again while starting or running is a no-op.
    pub fn start(self: &Arc<Self>) -> Result<(), MatchingError> {
        if !self.lifecycle.begin_start()? {
            return Ok(());
        }
        if !self.lifecycle.mark_running() {
            // stopped while starting
            return Err(MatchingError::Unavailable);
        }
        self.registry.mark_alive();
        tokio::spawn(Arc::clone(self).run_reader());
        info!(queue = %self.key, instance = self.instance, "partition started");
        Ok(())
    }

    pub async fn wait_until_initialized(&self, cancel: &CancellationToken) -> Result<(), MatchingError> {
        self.lifecycle.wait_until_running(cancel).await
    }

    /// Stop the partition. Idempotent; only the first cause is recorded.
    ///
    /// Parked pollers are released with `Unavailable`, the backlog reader exits and
    /// in-flight dispatches give their tasks back to the backlog. The owner is
    /// notified once, after the partition reached `Stopped`.
    pub fn stop(&self, cause: UnloadCause) {
        if !self.lifecycle.begin_stop(cause) {
            debug!(queue = %self.key, cause = cause.as_label(), "partition already stopping");
            return;
        }
        info!(
            queue = %self.key,
            instance = self.instance,
            cause = cause.as_label(),
            "stopping partition"
        );
        self.matcher.close();
        self.lifecycle.mark_stopped();
        if let Some(owner) = self.owner.as_ref().and_then(Weak::upgrade) {
            owner.partition_unloaded(&self.key, self.instance, cause);
        }
    }

    /// Unload initiated by the partition itself (e.g. it lost backlog ownership).
    pub fn unload_from_partition_manager(&self, cause: UnloadCause) {
        warn!(queue = %self.key, cause = cause.as_label(), "partition unloading itself");
        self.stop(cause);
    }

    /// Hand the task straight to a waiting poller. `Ok(false)` if none is waiting.
    pub async fn try_sync_match(
        &self,
        cancel: &CancellationToken,
        info: TaskInfo,
    ) -> Result<bool, MatchingError> {
        self.lifecycle.ensure_running()?;
        if cancel.is_cancelled() {
            return Err(MatchingError::Cancelled);
        }
        self.registry.mark_alive();
        loop {
            let (task, acceptance) = Task::in_flight(info.clone(), TaskSource::SyncMatch);
            match self.matcher.offer(task, acceptance).await {
                OfferOutcome::Accepted => {
                    self.counters.incr(Counter::SyncMatched);
                    debug!(queue = %self.key, task_id = %info.task_id, "task sync-matched");
                    return Ok(true);
                }
                OfferOutcome::Lost => {
                    debug!(queue = %self.key, task_id = %info.task_id, "poller vanished before accepting, re-offering");
                }
                OfferOutcome::NoPoller(_) => return Ok(false),
                OfferOutcome::Closed(_) => return Err(MatchingError::Unavailable),
                OfferOutcome::Interrupted(_, err) => return Err(err),
            }
        }
    }

    /// Sync-match, falling back to the backlog.
    pub async fn add_task(
        &self,
        cancel: &CancellationToken,
        info: TaskInfo,
    ) -> Result<AddTaskOutcome, MatchingError> {
        if self.try_sync_match(cancel, info.clone()).await? {
            return Ok(AddTaskOutcome::SyncMatched);
        }
        self.spool_task(info).await.map(AddTaskOutcome::Spooled)
    }

    /// Long-poll for a task.
    ///
    /// `Ok(None)` when the deadline passes or routing data changed mid-poll.
    pub async fn poll_task(
        &self,
        cancel: &CancellationToken,
        meta: &PollMetadata,
    ) -> Result<Option<PolledTask>, MatchingError> {
        self.lifecycle.ensure_running()?;
        self.registry.update(meta);

        let started = Instant::now();
        let deadline = started + meta.timeout.unwrap_or(self.config.default_poll_timeout);
        let mut user_data = self.user_data.subscribe();
        let user_data_changed = async move {
            if user_data.changed().await.is_err() {
                pending::<()>().await;
            }
        };

        let outcome = self
            .matcher
            .poll(
                &meta.identity,
                meta.build_id.as_deref(),
                deadline,
                cancel.cancelled(),
                user_data_changed,
            )
            .await;

        // Polls that come back empty still count as poller activity.
        self.registry.update(meta);
        match outcome? {
            PollOutcome::Task(task) => {
                self.advisor.record_poll(started.elapsed(), true);
                debug!(
                    queue = %self.key,
                    poller = %meta.identity,
                    task_id = %task.info().task_id,
                    "task polled"
                );
                Ok(Some(task))
            }
            PollOutcome::DeadlineExceeded => {
                self.advisor.record_poll(started.elapsed(), false);
                Ok(None)
            }
            PollOutcome::UserDataChanged => {
                debug!(queue = %self.key, poller = %meta.identity, "user data changed during poll");
                Ok(None)
            }
        }
    }

    /// Scaling hint for a poll that started at `poll_start`.
    pub fn make_poller_scaling_decision(&self, poll_start: DateTime<Utc>) -> ScalingDecision {
        let wait = (self.clock.now() - poll_start).to_std().unwrap_or_default();
        self.advisor
            .decide(wait, self.registry.occupancy(), self.spool.approx_len())
    }

    pub fn get_all_poller_info(&self) -> Vec<PollerInfo> {
        self.registry.all()
    }

    pub fn update_poller_info(&self, meta: &PollMetadata) -> Result<(), MatchingError> {
        self.lifecycle.ensure_running()?;
        self.registry.update(meta);
        Ok(())
    }

    pub fn has_poller_after(&self, t: DateTime<Utc>) -> bool {
        self.registry.has_poller_after(t)
    }

    pub fn mark_alive(&self) {
        self.registry.mark_alive();
    }

    /// Last time the partition saw a poll or a task.
    pub fn last_alive(&self) -> Option<DateTime<Utc>> {
        self.registry.last_alive()
    }

    /// Signal a routing/versioning data change.
    ///
    /// Parked polls return empty and parked backlog dispatches re-validate their task.
    pub fn user_data_changed(&self) {
        self.user_data.send_modify(|v| *v = v.wrapping_add(1));
        debug!(queue = %self.key, "user data changed");
    }

    pub async fn get_stats(&self) -> Result<QueueStats, MatchingError> {
        let backlog = self.backlog.stats(&self.key).await?;
        self.spool.set_approx_len(backlog.len);
        let now = self.clock.now();
        let age = backlog
            .oldest_created_at
            .and_then(|t| (now - t).to_std().ok())
            .unwrap_or_default();
        Ok(QueueStats {
            approximate_backlog_count: backlog.len,
            approximate_backlog_age: age,
            waiting_pollers: self.matcher.waiting_pollers(),
            counters: self.counters.snapshot(),
        })
    }

    pub fn get_internal_task_queue_status(&self) -> InternalTaskQueueStatus {
        InternalTaskQueueStatus {
            queue_key: self.key.to_string(),
            instance: self.instance,
            state: self.lifecycle.state(),
            read_level: self.spool.read_level(),
            outstanding_dispatches: self.spool.outstanding(),
            waiting_pollers: self.matcher.waiting_pollers(),
            parked_offers: self.matcher.parked_offers(),
            approximate_backlog_count: self.spool.approx_len(),
            unload_cause: self.lifecycle.cause(),
        }
    }

    pub fn describe(&self, include_status: bool) -> DescribeResponse {
        DescribeResponse {
            pollers: self.registry.all(),
            status: include_status.then(|| self.get_internal_task_queue_status()),
        }
    }

    /// Deliver a query to a poller and wait for its answer. Never spooled.
    pub async fn dispatch_query_task(
        &self,
        cancel: &CancellationToken,
        request_id: RequestId,
        info: TaskInfo,
    ) -> Result<serde_json::Value, MatchingError> {
        self.dispatch_request(cancel, request_id, RequestKind::Query, info)
            .await
    }

    /// Deliver a nexus operation to a poller and wait for its answer. Never spooled.
    pub async fn dispatch_nexus_task(
        &self,
        cancel: &CancellationToken,
        request_id: RequestId,
        info: TaskInfo,
    ) -> Result<serde_json::Value, MatchingError> {
        self.dispatch_request(cancel, request_id, RequestKind::Nexus, info)
            .await
    }

    async fn dispatch_request(
        &self,
        cancel: &CancellationToken,
        request_id: RequestId,
        kind: RequestKind,
        info: TaskInfo,
    ) -> Result<serde_json::Value, MatchingError> {
        self.lifecycle.ensure_running()?;
        self.registry.mark_alive();
        let shutdown = self.lifecycle.shutdown_token();
        let deadline = info.expires_at.map(|at| self.instant_at(at));

        let response = loop {
            let (tx, rx) = oneshot::channel();
            let (task, acceptance) =
                Task::in_flight(info.clone(), TaskSource::Request(request_id, kind));
            let task = task.with_responder(tx);
            let interrupt = async {
                tokio::select! {
                    _ = cancel.cancelled() => MatchingError::Cancelled,
                    _ = shutdown.cancelled() => MatchingError::Unavailable,
                    _ = sleep_until_opt(deadline) => MatchingError::DeadlineExceeded,
                }
            };
            match self.matcher.offer_blocking(task, acceptance, interrupt).await {
                OfferOutcome::Accepted => break rx,
                OfferOutcome::Lost => continue,
                // blocking offers only come back untaken when the matcher is closed
                OfferOutcome::NoPoller(_) | OfferOutcome::Closed(_) => {
                    return Err(MatchingError::Unavailable);
                }
                OfferOutcome::Interrupted(_, err) => return Err(err),
            }
        };
        debug!(queue = %self.key, %request_id, ?kind, "request accepted, awaiting response");

        tokio::select! {
            res = response => match res {
                Ok(value) => {
                    self.counters.incr(Counter::RequestsAnswered);
                    Ok(value)
                }
                Err(_) => Err(MatchingError::ResponderDropped),
            },
            _ = cancel.cancelled() => Err(MatchingError::Cancelled),
            _ = shutdown.cancelled() => Err(MatchingError::Unavailable),
            _ = sleep_until_opt(deadline) => Err(MatchingError::DeadlineExceeded),
        }
    }

    /// Map a wall-clock time onto the tokio timer.
    pub(super) fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        let until = (at - self.clock.now()).to_std().unwrap_or_default();
        Instant::now() + until
    }
}

pub(super) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{NamespaceId, PollerIdentity, TaskQueueKind, VersioningTag};
    use crate::impls::InMemoryBacklog;
    use std::time::Duration;

    fn key() -> QueueKey {
        QueueKey::root("orders", TaskQueueKind::Activity)
    }

    fn running() -> Arc<Partition> {
        let partition = Partition::builder(key(), Arc::new(InMemoryBacklog::new()))
            .build()
            .unwrap();
        partition.start().unwrap();
        partition
    }

    fn info(p: &Partition) -> TaskInfo {
        TaskInfo::new(
            p.id_generator().generate_task_id(),
            NamespaceId::new("ns"),
            serde_json::json!({"n": 1}),
            Utc::now(),
        )
    }

    fn meta(name: &str, timeout_ms: u64) -> PollMetadata {
        PollMetadata::new(PollerIdentity::new(name)).with_timeout(Duration::from_millis(timeout_ms))
    }

    fn spawn_poll(
        p: &Arc<Partition>,
        name: &str,
        timeout_ms: u64,
    ) -> tokio::task::JoinHandle<Result<Option<PolledTask>, MatchingError>> {
        let p = Arc::clone(p);
        let meta = meta(name, timeout_ms);
        tokio::spawn(async move { p.poll_task(&CancellationToken::new(), &meta).await })
    }

    async fn wait_for_pollers(p: &Partition, n: usize) {
        while p.matcher.waiting_pollers() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[test]
    fn build_rejects_invalid_config() {
        let config = MatchingConfig {
            max_outstanding_dispatches: 0,
            ..MatchingConfig::default()
        };
        let res = Partition::builder(key(), Arc::new(InMemoryBacklog::new()))
            .config(config)
            .build();
        assert!(matches!(res, Err(ConfigError::Zero { .. })));
    }

    #[tokio::test]
    async fn operations_before_start_are_unavailable() {
        let p = Partition::builder(key(), Arc::new(InMemoryBacklog::new()))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        assert!(matches!(
            p.try_sync_match(&cancel, info(&p)).await,
            Err(MatchingError::Unavailable)
        ));
        assert!(matches!(
            p.poll_task(&cancel, &meta("w", 10)).await,
            Err(MatchingError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let p = running();
        p.start().unwrap();
        assert_eq!(p.state(), PartitionState::Running);
        assert!(p.wait_until_initialized(&CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn sync_match_delivers_to_waiting_poller() {
        let p = running();
        let poll = spawn_poll(&p, "w1", 5_000);
        wait_for_pollers(&p, 1).await;

        let task = info(&p);
        let task_id = task.task_id;
        assert!(p.try_sync_match(&CancellationToken::new(), task).await.unwrap());

        let polled = poll.await.unwrap().unwrap().unwrap();
        assert_eq!(polled.info().task_id, task_id);
        assert_eq!(polled.source(), TaskSource::SyncMatch);
        assert_eq!(p.counters.snapshot().sync_matched, 1);
    }

    #[tokio::test]
    async fn sync_match_without_poller_misses() {
        let p = running();
        assert!(!p.try_sync_match(&CancellationToken::new(), info(&p)).await.unwrap());
    }

    #[tokio::test]
    async fn poll_timeout_returns_none_and_registers_poller() {
        let p = running();
        let res = p
            .poll_task(&CancellationToken::new(), &meta("w1", 20))
            .await
            .unwrap();
        assert!(res.is_none());
        let pollers = p.get_all_poller_info();
        assert_eq!(pollers.len(), 1);
        assert_eq!(pollers[0].identity.as_str(), "w1");
    }

    #[tokio::test]
    async fn cancelled_poll_reports_cancelled() {
        let p = running();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            p.poll_task(&cancel, &meta("w1", 5_000)).await,
            Err(MatchingError::Cancelled)
        ));
        assert_eq!(p.matcher.waiting_pollers(), 0);
    }

    #[tokio::test]
    async fn user_data_change_wakes_parked_poll() {
        let p = running();
        let poll = spawn_poll(&p, "w1", 5_000);
        wait_for_pollers(&p, 1).await;
        p.user_data_changed();
        assert!(poll.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_releases_pollers_and_rejects_new_work() {
        let p = running();
        let poll = spawn_poll(&p, "w1", 5_000);
        wait_for_pollers(&p, 1).await;

        p.stop(UnloadCause::Idle);
        assert!(matches!(poll.await.unwrap(), Err(MatchingError::Unavailable)));
        assert_eq!(p.state(), PartitionState::Stopped);

        p.stop(UnloadCause::ConfigChange);
        assert_eq!(p.unload_cause(), Some(UnloadCause::Idle));
        assert!(matches!(p.start(), Err(MatchingError::Unavailable)));
        assert!(matches!(
            p.spool_task(info(&p)).await,
            Err(MatchingError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn query_round_trip() {
        let p = running();
        let worker = {
            let p = Arc::clone(&p);
            tokio::spawn(async move {
                let mut task = p
                    .poll_task(&CancellationToken::new(), &meta("w1", 5_000))
                    .await
                    .unwrap()
                    .unwrap();
                assert!(matches!(task.source(), TaskSource::Request(_, RequestKind::Query)));
                let responder = task.take_responder().unwrap();
                assert!(responder.respond(serde_json::json!({"answer": 42})));
            })
        };

        let request_id = p.id_generator().generate_request_id();
        let answer = p
            .dispatch_query_task(&CancellationToken::new(), request_id, info(&p))
            .await
            .unwrap();
        assert_eq!(answer, serde_json::json!({"answer": 42}));
        worker.await.unwrap();
        assert_eq!(p.counters.snapshot().requests_answered, 1);
    }

    #[tokio::test]
    async fn nexus_request_without_response_fails() {
        let p = running();
        let worker = {
            let p = Arc::clone(&p);
            tokio::spawn(async move {
                // take the task and drop the responder
                let _ = p
                    .poll_task(&CancellationToken::new(), &meta("w1", 5_000))
                    .await
                    .unwrap()
                    .unwrap();
            })
        };
        let request_id = p.id_generator().generate_request_id();
        let res = p
            .dispatch_nexus_task(&CancellationToken::new(), request_id, info(&p))
            .await;
        assert!(matches!(res, Err(MatchingError::ResponderDropped)));
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn request_past_its_expiry_times_out() {
        let p = running();
        let request_id = p.id_generator().generate_request_id();
        let task = info(&p).with_expires_at(Utc::now() + chrono::Duration::milliseconds(30));
        let res = p
            .dispatch_query_task(&CancellationToken::new(), request_id, task)
            .await;
        assert!(matches!(res, Err(MatchingError::DeadlineExceeded)));
        assert_eq!(p.matcher.parked_offers(), 0);
    }

    #[tokio::test]
    async fn pinned_task_waits_for_matching_build() {
        let p = running();
        let old = {
            let p = Arc::clone(&p);
            let meta = meta("old", 100).with_build_id("b1");
            tokio::spawn(async move { p.poll_task(&CancellationToken::new(), &meta).await })
        };
        wait_for_pollers(&p, 1).await;
        let pinned = info(&p).with_versioning(VersioningTag::Pinned("b2".into()));
        assert!(!p.try_sync_match(&CancellationToken::new(), pinned).await.unwrap());
        assert!(old.await.unwrap().unwrap().is_none());
    }

    #[tokio::test]
    async fn describe_includes_status_on_request() {
        let p = running();
        p.update_poller_info(&meta("w1", 10).with_capacity(3)).unwrap();
        let without = p.describe(false);
        assert_eq!(without.pollers.len(), 1);
        assert!(without.status.is_none());

        let with = p.describe(true);
        let status = with.status.unwrap();
        assert_eq!(status.state, PartitionState::Running);
        assert_eq!(status.queue_key, "orders/activity/0");
        assert_eq!(status.unload_cause, None);
    }

    #[tokio::test]
    async fn scaling_decision_after_repeated_timeouts() {
        let p = running();
        let cancel = CancellationToken::new();
        // pinned to a build nobody runs, so it stays in the backlog
        let pinned = info(&p).with_versioning(VersioningTag::Pinned("nobody".into()));
        p.spool_task(pinned).await.unwrap();
        for _ in 0..3 {
            let _ = p
                .poll_task(&cancel, &meta("w1", 10).with_build_id("other"))
                .await
                .unwrap();
        }
        let decision = p.make_poller_scaling_decision(Utc::now());
        assert!(matches!(decision, ScalingDecision::Increase(_)));
    }
}
