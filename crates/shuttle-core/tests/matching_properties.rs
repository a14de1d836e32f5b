use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use shuttle_core::app::PartitionManager;
use shuttle_core::domain::{
    MatchingError, NamespaceId, PollMetadata, PollerIdentity, QueueKey, TaskId, TaskInfo,
    TaskQueueKind, UnloadCause,
};
use shuttle_core::impls::InMemoryBacklog;
use shuttle_core::matching::scaling::{decide, ScalingBounds, ScalingInputs};
use shuttle_core::matching::{MatchingConfig, Partition, PartitionState, ScalingDecision};
use shuttle_core::ports::Backlog;
use tokio_util::sync::CancellationToken;

fn key() -> QueueKey {
    QueueKey::root("payments", TaskQueueKind::Activity)
}

fn config() -> MatchingConfig {
    MatchingConfig {
        backlog_recheck_interval: Duration::from_millis(20),
        ..MatchingConfig::default()
    }
}

fn start(backlog: Arc<InMemoryBacklog>) -> Arc<Partition> {
    let backlog: Arc<dyn Backlog> = backlog;
    let partition = Partition::builder(key(), backlog)
        .config(config())
        .build()
        .unwrap();
    partition.start().unwrap();
    partition
}

fn new_task(p: &Partition, n: u64) -> TaskInfo {
    TaskInfo::new(
        p.id_generator().generate_task_id(),
        NamespaceId::new("default"),
        serde_json::json!({ "n": n }),
        Utc::now(),
    )
}

fn meta(name: &str, timeout_ms: u64) -> PollMetadata {
    PollMetadata::new(PollerIdentity::new(name)).with_timeout(Duration::from_millis(timeout_ms))
}

fn waiting_pollers(p: &Partition) -> usize {
    p.get_internal_task_queue_status().waiting_pollers
}

async fn wait_for_waiting_pollers(p: &Partition, n: usize) {
    while waiting_pollers(p) < n {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_task_is_delivered_exactly_once_without_failures() {
    const PRODUCERS: u64 = 4;
    const PER_PRODUCER: u64 = 25;
    const TOTAL: usize = (PRODUCERS * PER_PRODUCER) as usize;

    let backlog = Arc::new(InMemoryBacklog::new());
    let p = start(Arc::clone(&backlog));
    let received: Arc<Mutex<Vec<TaskId>>> = Arc::new(Mutex::new(Vec::new()));
    let count = Arc::new(AtomicUsize::new(0));

    let mut pollers = Vec::new();
    for i in 0..3 {
        let p = Arc::clone(&p);
        let received = Arc::clone(&received);
        let count = Arc::clone(&count);
        pollers.push(tokio::spawn(async move {
            let meta = meta(&format!("worker-{i}"), 50);
            while count.load(Ordering::SeqCst) < TOTAL {
                if let Some(task) = p.poll_task(&CancellationToken::new(), &meta).await.unwrap() {
                    received.lock().unwrap().push(task.info().task_id);
                    count.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }

    let mut producers = Vec::new();
    let sent: Arc<Mutex<HashSet<TaskId>>> = Arc::new(Mutex::new(HashSet::new()));
    for n in 0..PRODUCERS {
        let p = Arc::clone(&p);
        let sent = Arc::clone(&sent);
        producers.push(tokio::spawn(async move {
            for i in 0..PER_PRODUCER {
                let task = new_task(&p, n * PER_PRODUCER + i);
                sent.lock().unwrap().insert(task.task_id);
                p.add_task(&CancellationToken::new(), task).await.unwrap();
            }
        }));
    }
    for h in producers {
        h.await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(10), async {
        for h in pollers {
            h.await.unwrap();
        }
    })
    .await
    .expect("pollers did not drain the queue");

    let received = received.lock().unwrap().clone();
    let unique: HashSet<TaskId> = received.iter().copied().collect();
    assert_eq!(received.len(), TOTAL, "duplicate deliveries");
    assert_eq!(unique, *sent.lock().unwrap(), "lost tasks");

    for _ in 0..200 {
        if backlog.pending(&key()).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(backlog.pending(&key()).is_empty());
    let stats = p.get_stats().await.unwrap();
    assert_eq!(stats.approximate_backlog_count, 0);
    assert_eq!(
        stats.counters.sync_matched + stats.counters.backlog_dispatched,
        TOTAL as u64
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spooled_task_survives_a_cancelled_poll() {
    for round in 0..20 {
        let backlog = Arc::new(InMemoryBacklog::new());
        let p = start(Arc::clone(&backlog));

        let cancel = CancellationToken::new();
        let first = {
            let p = Arc::clone(&p);
            let cancel = cancel.clone();
            tokio::spawn(async move { p.poll_task(&cancel, &meta("first", 5_000)).await })
        };
        wait_for_waiting_pollers(&p, 1).await;

        let task = new_task(&p, round);
        let task_id = task.task_id;
        p.spool_task(task).await.unwrap();
        cancel.cancel();

        let got_first = match first.await.unwrap() {
            Ok(Some(t)) => {
                assert_eq!(t.info().task_id, task_id);
                true
            }
            Ok(None) => panic!("poll ended without task or cancellation"),
            Err(MatchingError::Cancelled) => false,
            Err(other) => panic!("unexpected error: {other}"),
        };

        let second = p
            .poll_task(&CancellationToken::new(), &meta("second", 300))
            .await
            .unwrap();
        match (got_first, second) {
            (true, None) => {}
            (false, Some(t)) => assert_eq!(t.info().task_id, task_id),
            (true, Some(_)) => panic!("task delivered twice"),
            (false, None) => panic!("task lost after cancelled poll"),
        }
        p.stop(UnloadCause::ManagerShutdown);
    }
}

#[tokio::test]
async fn longest_waiting_poller_is_served_first() {
    let p = start(Arc::new(InMemoryBacklog::new()));
    let mut polls = Vec::new();
    for i in 0..3 {
        let p2 = Arc::clone(&p);
        let meta = meta(&format!("w{i}"), 5_000);
        polls.push(tokio::spawn(async move {
            p2.poll_task(&CancellationToken::new(), &meta).await
        }));
        wait_for_waiting_pollers(&p, i + 1).await;
    }

    let mut sent = Vec::new();
    for n in 0..3 {
        let task = new_task(&p, n);
        sent.push(task.task_id);
        assert!(p.try_sync_match(&CancellationToken::new(), task).await.unwrap());
    }
    for (poll, expected) in polls.into_iter().zip(sent) {
        let task = poll.await.unwrap().unwrap().unwrap();
        assert_eq!(task.info().task_id, expected);
    }
}

#[tokio::test]
async fn dropped_poll_never_swallows_a_task() {
    let backlog = Arc::new(InMemoryBacklog::new());
    let p = start(Arc::clone(&backlog));
    let poll = {
        let p = Arc::clone(&p);
        tokio::spawn(async move { p.poll_task(&CancellationToken::new(), &meta("gone", 5_000)).await })
    };
    wait_for_waiting_pollers(&p, 1).await;
    poll.abort();
    let _ = poll.await;
    assert_eq!(waiting_pollers(&p), 0);

    let task = new_task(&p, 1);
    let task_id = task.task_id;
    assert!(!p.try_sync_match(&CancellationToken::new(), task.clone()).await.unwrap());
    p.spool_task(task).await.unwrap();
    let polled = p
        .poll_task(&CancellationToken::new(), &meta("next", 2_000))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(polled.info().task_id, task_id);
}

#[tokio::test]
async fn stop_is_idempotent_and_final() {
    let p = start(Arc::new(InMemoryBacklog::new()));
    p.stop(UnloadCause::OwnershipLost);
    p.stop(UnloadCause::Idle);
    p.stop(UnloadCause::ManagerShutdown);

    assert_eq!(p.state(), PartitionState::Stopped);
    assert_eq!(p.unload_cause(), Some(UnloadCause::OwnershipLost));
    assert!(matches!(p.start(), Err(MatchingError::Unavailable)));

    let cancel = CancellationToken::new();
    assert!(matches!(
        p.try_sync_match(&cancel, new_task(&p, 0)).await,
        Err(MatchingError::Unavailable)
    ));
    assert!(matches!(
        p.spool_task(new_task(&p, 0)).await,
        Err(MatchingError::Unavailable)
    ));
    assert!(matches!(
        p.poll_task(&cancel, &meta("w", 10)).await,
        Err(MatchingError::Unavailable)
    ));
    assert!(matches!(
        p.wait_until_initialized(&cancel).await,
        Err(MatchingError::Unavailable)
    ));
}

#[tokio::test]
async fn manager_replaces_a_partition_that_lost_ownership() {
    let backlog = Arc::new(InMemoryBacklog::new());
    let manager = PartitionManager::new(backlog.clone(), config()).unwrap();
    let cancel = CancellationToken::new();
    let first = manager.get_or_create(&key(), &cancel).await.unwrap();

    backlog.fence(&key());
    let err = first.spool_task(new_task(&first, 0)).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(first.unload_cause(), Some(UnloadCause::OwnershipLost));
    assert!(manager.get(&key()).is_none());

    backlog.unfence(&key());
    let second = manager.get_or_create(&key(), &cancel).await.unwrap();
    assert_ne!(first.instance(), second.instance());
    assert_eq!(second.state(), PartitionState::Running);
}

#[test]
fn scaling_examples() {
    let bounds = ScalingBounds::from(&MatchingConfig::default());

    let fast_and_crowded = ScalingInputs {
        average_wait: Duration::from_millis(5),
        occupancy: 20,
        backlog_len: 0,
        consecutive_timeouts: 0,
    };
    assert!(matches!(
        decide(&bounds, &fast_and_crowded),
        ScalingDecision::Decrease(_)
    ));

    let starving = ScalingInputs {
        average_wait: Duration::from_millis(500),
        occupancy: 5,
        backlog_len: 12,
        consecutive_timeouts: 3,
    };
    assert!(matches!(
        decide(&bounds, &starving),
        ScalingDecision::Increase(_)
    ));
}
