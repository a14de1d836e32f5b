//! App - パーティションの束ね役
//!
//! - **manager**: queue key → `Partition` の表（get-or-create / unload / idle eviction / shutdown）

pub mod manager;

pub use self::manager::PartitionManager;
