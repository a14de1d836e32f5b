//! Matching - パーティション内のマッチングエンジン
//!
//! - **matcher**: sync-match rendezvous（待機 poller と parked offer）
//! - **compat**: task と poller の互換性判定（visibility / build pin）
//! - **spool**: backlog への書き込みと reader、spooled task の配送
//! - **registry**: 最近 poll してきた poller の記録
//! - **scaling**: poller 数の増減ヒント
//! - **lifecycle**: Created → Starting → Running → Stopping → Stopped
//! - **partition**: 上記をまとめた `Partition`
//! - **stats**: stats / internal status / describe のスナップショット

pub mod compat;
pub mod config;
pub mod lifecycle;
pub mod matcher;
pub mod partition;
pub mod registry;
pub mod scaling;
pub mod spool;
pub mod stats;

pub use self::config::{ConfigError, MatchingConfig};
pub use self::lifecycle::PartitionState;
pub use self::partition::{AddTaskOutcome, Partition, PartitionBuilder};
pub use self::scaling::ScalingDecision;
pub use self::stats::{CounterSnapshot, DescribeResponse, InternalTaskQueueStatus, QueueStats};
