//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryBacklog**: 開発用の backlog
//!
//! 本番用の backlog（永続ストア）は別クレートに配置します。

pub mod inmem_backlog;

pub use self::inmem_backlog::InMemoryBacklog;
