//! Ports - 抽象化レイヤー
//!
//! マッチングコアが外部に依存する境界を trait として定義します。
//!
//! # 境界
//! - **Backlog**: spool された task の永続ストア（append / read_next / ack）
//! - **Clock**: 現在時刻
//! - **IdGenerator**: TaskId / RequestId の払い出し
//! - **PartitionOwner**: パーティションの停止をマネージャへ通知

pub mod backlog;
pub mod clock;
pub mod id_generator;
pub mod owner;

pub use self::backlog::{Backlog, BacklogEntry, BacklogError, BacklogStats};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::owner::PartitionOwner;
