//! PartitionManager - queue key ごとのパーティション表
//!
//! # 責務
//! - get-or-create: 無ければ作って start し、Running になるまで待つ
//! - unload: 指定した原因でパーティションを停止する
//! - idle eviction: 一定時間 poll も task も無いパーティションを停止する
//! - shutdown: 全パーティションを `ManagerShutdown` で停止する
//!
//! パーティションは停止完了時に `PartitionOwner` 経由でここへ通知し、表から外れます。
//! 表のロックを持ったまま `Partition::stop` を呼ばないこと（通知が同じロックを取る）。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{MatchingError, QueueKey, UnloadCause};
use crate::matching::{ConfigError, MatchingConfig, Partition};
use crate::ports::{Backlog, Clock, IdGenerator, PartitionOwner, SystemClock, UlidGenerator};

pub struct PartitionManager {
    backlog: Arc<dyn Backlog>,
    config: MatchingConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    partitions: Mutex<HashMap<QueueKey, Arc<Partition>>>,
    shutting_down: AtomicBool,
    this: Weak<PartitionManager>,
}

impl PartitionManager {
    pub fn new(backlog: Arc<dyn Backlog>, config: MatchingConfig) -> Result<Arc<Self>, ConfigError> {
        Self::with_clock(backlog, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        backlog: Arc<dyn Backlog>,
        config: MatchingConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Ok(Arc::new_cyclic(|this| Self {
            backlog,
            config,
            clock,
            ids,
            partitions: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            this: this.clone(),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<QueueKey, Arc<Partition>>> {
        self.partitions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id_generator(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    /// Loaded partition for `key`, if any.
    pub fn get(&self, key: &QueueKey) -> Option<Arc<Partition>> {
        self.lock().get(key).cloned()
    }

    pub fn loaded_keys(&self) -> Vec<QueueKey> {
        let mut keys: Vec<QueueKey> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Partition for `key`, loading and starting it if needed. Returns once it is `Running`.
    pub async fn get_or_create(
        &self,
        key: &QueueKey,
        cancel: &CancellationToken,
    ) -> Result<Arc<Partition>, MatchingError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(MatchingError::Unavailable);
        }
        let (partition, created) = {
            let mut partitions = self.lock();
            match partitions.get(key) {
                Some(p) if !p.state().is_terminating() => (Arc::clone(p), false),
                _ => {
                    let owner: Weak<dyn PartitionOwner> = self.this.clone();
                    let partition = Partition::builder(key.clone(), Arc::clone(&self.backlog))
                        .config(self.config.clone())
                        .clock(Arc::clone(&self.clock))
                        .id_generator(Arc::clone(&self.ids))
                        .owner(owner)
                        .build()
                        .map_err(|e| MatchingError::InvalidState(e.to_string()))?;
                    partitions.insert(key.clone(), Arc::clone(&partition));
                    (partition, true)
                }
            }
        };
        if created {
            debug!(queue = %key, instance = partition.instance(), "loading partition");
            partition.start()?;
        }
        partition.wait_until_initialized(cancel).await?;
        Ok(partition)
    }

    /// Stop the partition loaded for `key`. Returns `false` if none was loaded.
    pub fn unload(&self, key: &QueueKey, cause: UnloadCause) -> bool {
        let partition = self.get(key);
        match partition {
            Some(p) => {
                p.stop(cause);
                true
            }
            None => false,
        }
    }

    /// Stop every partition without poll or task activity for `idle_unload_after`.
    pub fn evict_idle(&self) -> usize {
        let idle = chrono::Duration::from_std(self.config.idle_unload_after)
            .unwrap_or(chrono::Duration::MAX);
        let Some(horizon) = self.clock.now().checked_sub_signed(idle) else {
            return 0;
        };
        let idle_partitions: Vec<Arc<Partition>> = self
            .lock()
            .values()
            .filter(|p| p.last_alive().is_none_or(|t| t <= horizon))
            .cloned()
            .collect();
        for p in &idle_partitions {
            p.stop(UnloadCause::Idle);
        }
        idle_partitions.len()
    }

    /// Periodically evict idle partitions until `cancel` fires.
    pub async fn run_idle_sweeper(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let evicted = self.evict_idle();
                    if evicted > 0 {
                        info!(evicted, "evicted idle partitions");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Stop all partitions and refuse new ones.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let drained: Vec<Arc<Partition>> = self.lock().drain().map(|(_, p)| p).collect();
        info!(partitions = drained.len(), "shutting down partition manager");
        for p in drained {
            p.stop(UnloadCause::ManagerShutdown);
        }
    }
}

impl PartitionOwner for PartitionManager {
    fn partition_unloaded(&self, key: &QueueKey, instance: u64, cause: UnloadCause) {
        let mut partitions = self.lock();
        // A newer instance may already be registered under the same key.
        if partitions.get(key).is_some_and(|p| p.instance() == instance) {
            partitions.remove(key);
        }
        drop(partitions);
        info!(
            queue = %key,
            instance,
            cause = cause.as_label(),
            reload_elsewhere = cause.is_retryable_elsewhere(),
            "partition unloaded"
        );
    }
}
