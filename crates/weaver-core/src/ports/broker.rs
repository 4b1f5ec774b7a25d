//! Broker port - 配送キュー
//!
//! at-least-once 配送の契約:
//! - lease は visibility timeout 付きの一時的な所有権。期限切れの envelope は
//!   delivery_count を 1 増やして再配送される
//! - ack / nack / dead_letter / extend_lease は lease token を持つ worker だけが
//!   有効期限内に呼べる。それ以外は `WeaverError::LeaseExpired`
//! - handler が visibility timeout より長く走る間は worker が extend_lease で延長する
//! - 接続できない場合は `WeaverError::BrokerUnavailable`（呼び出し側で backoff）
//!
//! # 実装
//! - `queue::InMemoryBroker`（テスト・デモ用）
//! - `weaver_pg::PgBroker`（PostgreSQL, `FOR UPDATE SKIP LOCKED`）

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::app::status::QueueCounts;
use crate::domain::{DeadLetterEntry, JobId, Lease, LeaseToken, NewJob, QueueName};
use crate::error::WeaverError;

/// Durable FIFO-per-queue transport. Must be safe for concurrent use by every slot.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Validates and stores a job. The id is assigned here.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, WeaverError>;

    /// Leases up to `count` envelopes, waiting at most `timeout` for the first one.
    /// Returns an empty list on timeout.
    async fn lease(
        &self,
        queue: &QueueName,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Lease>, WeaverError>;

    /// Pushes the lease deadline to now + visibility timeout and returns it.
    async fn extend_lease(
        &self,
        job_id: JobId,
        token: LeaseToken,
    ) -> Result<DateTime<Utc>, WeaverError>;

    /// Removes the envelope for good.
    async fn ack(&self, job_id: JobId, token: LeaseToken) -> Result<(), WeaverError>;

    /// Returns the envelope to the queue, visible again no earlier than now + delay.
    async fn nack(
        &self,
        job_id: JobId,
        token: LeaseToken,
        delay: Duration,
        error: &str,
    ) -> Result<(), WeaverError>;

    /// Moves the envelope to the dead-letter sink.
    async fn dead_letter(
        &self,
        job_id: JobId,
        token: LeaseToken,
        error: &str,
    ) -> Result<(), WeaverError>;

    /// Oldest first.
    async fn dead_letters(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, WeaverError>;

    /// Puts a dead-lettered job back on its queue with a fresh retry budget and
    /// the next result generation.
    async fn replay_dead_letter(&self, job_id: JobId) -> Result<(), WeaverError>;

    async fn counts(&self, queue: &QueueName) -> Result<QueueCounts, WeaverError>;

    /// Cheap reachability check used by the startup coordinator.
    async fn ping(&self) -> Result<(), WeaverError>;
}
