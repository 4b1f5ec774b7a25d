//! ScheduleStore / SchedulerLock ports - 定期実行テーブル
//!
//! テーブルを書くのは scheduler の tick loop だけ。
//! 複数プロセスが同時に tick しないよう SchedulerLock で single-writer を保証する。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::ScheduleEntry;
use crate::error::WeaverError;

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn load_schedules(&self) -> Result<Vec<ScheduleEntry>, WeaverError>;

    /// Inserts or updates the definition. An existing `last_fired_at` and
    /// `created_at` are preserved.
    async fn upsert_schedule(&self, entry: &ScheduleEntry) -> Result<(), WeaverError>;

    async fn mark_fired(&self, name: &str, at: DateTime<Utc>) -> Result<(), WeaverError>;
}

/// Cross-process mutual exclusion for the scheduler.
#[async_trait]
pub trait SchedulerLock: Send + Sync {
    /// Non-blocking. `true` when this process now holds the lock.
    async fn try_acquire(&self) -> Result<bool, WeaverError>;

    /// Whether the lock taken by `try_acquire` is still ours. A lock can be lost
    /// without `release` (dropped session), so the holder checks before acting.
    async fn is_held(&self) -> Result<bool, WeaverError>;

    async fn release(&self) -> Result<(), WeaverError>;
}
