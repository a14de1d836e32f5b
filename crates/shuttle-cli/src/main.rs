use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use serde::Serialize;
use shuttle_core::app::PartitionManager;
use shuttle_core::domain::{
    MatchingError, NamespaceId, PollMetadata, PollerIdentity, Priority, QueueKey, TaskInfo,
    TaskQueueKind,
};
use shuttle_core::impls::InMemoryBacklog;
use shuttle_core::matching::{DescribeResponse, MatchingConfig, Partition, QueueStats};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Drive one task-queue partition with in-process producers and pollers.
#[derive(Debug, Parser)]
#[command(name = "shuttle", version, about)]
struct Args {
    /// Task queue name
    #[arg(long, default_value = "demo")]
    queue: String,

    /// JSON matching config (durations in milliseconds)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 2)]
    producers: u64,

    #[arg(long, default_value_t = 20)]
    tasks_per_producer: u64,

    #[arg(long, default_value_t = 3)]
    pollers: usize,

    /// Long-poll timeout per poll call
    #[arg(long, default_value_t = 500)]
    poll_timeout_ms: u64,

    /// Delay every n-th task's visibility by 200ms (0 disables)
    #[arg(long, default_value_t = 5)]
    delay_every: u64,
}

#[derive(Serialize)]
struct Report {
    queue: String,
    stats: QueueStats,
    describe: DescribeResponse,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn init_logging() -> Result<(), BoxError> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<MatchingConfig, BoxError> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            Ok(MatchingConfig::from_json_str(&raw)?)
        }
        None => Ok(MatchingConfig::default()),
    }
}

/// Poll until the partition goes away or `cancel` fires.
async fn poller_loop(
    partition: Arc<Partition>,
    name: String,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let meta = PollMetadata::new(PollerIdentity::new(name.clone()))
        .with_timeout(timeout)
        .with_capacity(1);
    loop {
        let poll_start = Utc::now();
        match partition.poll_task(&cancel, &meta).await {
            Ok(Some(mut task)) => {
                debug!(poller = %name, task_id = %task.info().task_id, "processing task");
                if let Some(responder) = task.take_responder() {
                    let answer = serde_json::json!({ "answered_by": name });
                    if !responder.respond(answer) {
                        warn!(poller = %name, "requester went away before the answer");
                    }
                }
            }
            Ok(None) => {}
            Err(MatchingError::Cancelled | MatchingError::Unavailable) => break,
            Err(err) => {
                warn!(poller = %name, error = %err, "poll failed");
                break;
            }
        }
        let decision = partition.make_poller_scaling_decision(poll_start);
        debug!(poller = %name, ?decision, "scaling hint");
    }
    debug!(poller = %name, "poller stopped");
}

async fn produce(partition: Arc<Partition>, producer: u64, count: u64, delay_every: u64) -> Result<(), MatchingError> {
    let cancel = CancellationToken::new();
    for n in 0..count {
        let now = Utc::now();
        let mut task = TaskInfo::new(
            partition.id_generator().generate_task_id(),
            NamespaceId::new("default"),
            serde_json::json!({ "producer": producer, "n": n }),
            now,
        )
        .with_priority(Priority::new((n % 5) as u8 + 1));
        if delay_every > 0 && n % delay_every == 0 {
            task = task.with_visible_at(now + chrono::Duration::milliseconds(200));
        }
        let outcome = partition.add_task(&cancel, task).await?;
        debug!(producer, n, ?outcome, "task added");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();
    init_logging()?;

    let config = load_config(args.config.as_ref())?;
    let manager = PartitionManager::new(Arc::new(InMemoryBacklog::new()), config)?;
    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(Arc::clone(&manager).run_idle_sweeper(Duration::from_secs(1), shutdown.clone()));

    let key = QueueKey::root(args.queue.clone(), TaskQueueKind::Activity);
    let partition = manager.get_or_create(&key, &shutdown).await?;
    info!(queue = %key, instance = partition.instance(), "partition ready");

    let poll_timeout = Duration::from_millis(args.poll_timeout_ms);
    let pollers: Vec<_> = (0..args.pollers)
        .map(|i| {
            tokio::spawn(poller_loop(
                Arc::clone(&partition),
                format!("worker-{i}"),
                poll_timeout,
                shutdown.clone(),
            ))
        })
        .collect();

    let producers: Vec<_> = (0..args.producers)
        .map(|p| {
            tokio::spawn(produce(
                Arc::clone(&partition),
                p,
                args.tasks_per_producer,
                args.delay_every,
            ))
        })
        .collect();
    for producer in producers {
        producer.await??;
    }

    let request_id = manager.id_generator().generate_request_id();
    let query = TaskInfo::new(
        manager.id_generator().generate_task_id(),
        NamespaceId::new("default"),
        serde_json::json!({ "query": "status" }),
        Utc::now(),
    )
    .with_expires_at(Utc::now() + chrono::Duration::seconds(5));
    let answer = partition.dispatch_query_task(&shutdown, request_id, query).await?;
    info!(%request_id, %answer, "query answered");

    let expected = args.producers * args.tasks_per_producer;
    let stats = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let stats = partition.get_stats().await?;
            let delivered = stats.counters.sync_matched + stats.counters.backlog_dispatched;
            if delivered + stats.counters.expired >= expected {
                return Ok::<_, MatchingError>(stats);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await??;

    let report = Report {
        queue: key.to_string(),
        stats,
        describe: partition.describe(true),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    manager.shutdown();
    shutdown.cancel();
    for poller in pollers {
        poller.await?;
    }
    sweeper.await?;
    Ok(())
}
