//! PartitionOwner port - パーティションを保持するマネージャへの通知
//!
//! パーティションは停止が完了したとき一度だけ owner に通知します。
//! owner 側はその instance を自分のテーブルから外します（同じ key で新しい
//! instance が既に登録されていれば何もしない）。

use crate::domain::{QueueKey, UnloadCause};

pub trait PartitionOwner: Send + Sync {
    fn partition_unloaded(&self, key: &QueueKey, instance: u64, cause: UnloadCause);
}
