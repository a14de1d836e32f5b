//! shuttle-core
//!
//! Per-partition task matching for a distributed task queue.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, queue_key, task, poller, unload, errors）
//! - **ports**: 抽象化レイヤー（Backlog, Clock, IdGenerator, PartitionOwner）
//! - **matching**: マッチングエンジン（matcher, spool, registry, scaling, lifecycle, partition）
//! - **app**: パーティション管理（PartitionManager）
//! - **impls**: 実装（InMemoryBacklog など開発用）

pub mod app;
pub mod domain;
pub mod impls;
pub mod matching;
pub mod ports;
