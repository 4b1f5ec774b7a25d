//! WorkerPool - lease → execute → ack / nack / dead-letter
//!
//! # フロー（1 slot あたり）
//! 1. Broker::lease() で envelope を 1 件取得
//! 2. Runtime::execute() で handler を期限付き実行（実行中は lease を延長し続ける）
//! 3. 成功: 結果を記録してから ack
//! 4. 失敗: 予算切れ or Permanent なら結果を記録して dead-letter、それ以外は nack(backoff)
//!
//! lease の延長に失敗した（他の worker に渡った）ら handler を中断し、何も書かない。
//!
//! slot 同士は状態を共有しない（Broker / ResultStore / Runtime は Arc で共有、読み取り専用）。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::runtime::Runtime;
use super::status::{WorkerStats, WorkerStatsSnapshot};
use crate::domain::time::elapsed;
use crate::domain::{DomainEvent, ExecutionResult, JobEnvelope, Lease, LeaseToken, QueueName};
use crate::error::WeaverError;
use crate::ports::{Broker, Clock, EventSink, ResultStore};
use crate::queue::RetryPolicy;

const MIN_LEASE_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queues: Vec<QueueName>,

    /// Slots per queue.
    pub concurrency: usize,

    /// How long one `lease` call may block waiting for work.
    pub lease_wait: Duration,

    /// Backoff between failed broker calls inside a slot.
    pub broker_backoff: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec![QueueName::new("default")],
            concurrency: 4,
            lease_wait: Duration::from_secs(5),
            broker_backoff: RetryPolicy::default_v1()
                .with_base_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(30))
                .with_jitter(false),
        }
    }
}

impl WorkerConfig {
    pub fn with_queues<Q: Into<QueueName>>(mut self, queues: impl IntoIterator<Item = Q>) -> Self {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_lease_wait(mut self, lease_wait: Duration) -> Self {
        self.lease_wait = lease_wait;
        self
    }

    pub fn with_broker_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.broker_backoff = backoff;
        self
    }

    fn validate(&self) -> Result<(), WeaverError> {
        if self.queues.is_empty() {
            return Err(WeaverError::validation("worker needs at least one queue"));
        }
        if self.concurrency == 0 {
            return Err(WeaverError::validation("concurrency must be at least 1"));
        }
        for queue in &self.queues {
            queue.validate()?;
        }
        Ok(())
    }
}

/// Shared collaborators of every slot.
#[derive(Clone)]
pub struct WorkerDeps {
    pub broker: Arc<dyn Broker>,
    pub results: Arc<dyn ResultStore>,
    pub runtime: Arc<Runtime>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
}

/// Handle to a running set of worker slots.
/// - `request_shutdown()` で新規 lease を止める
/// - `shutdown(grace)` で猶予つき停止（猶予を過ぎたら cancel → nack）
pub struct WorkerPool {
    stop_tx: watch::Sender<bool>,
    cancel_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerPool {
    pub fn spawn(config: WorkerConfig, deps: WorkerDeps) -> Result<Self, WeaverError> {
        config.validate()?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let stats = Arc::new(WorkerStats::default());

        let mut joins = Vec::with_capacity(config.queues.len() * config.concurrency);
        for queue in &config.queues {
            for index in 0..config.concurrency {
                let slot = Slot {
                    name: format!("{queue}#{index}"),
                    queue: queue.clone(),
                    lease_wait: config.lease_wait,
                    broker_backoff: config.broker_backoff.clone(),
                    deps: deps.clone(),
                    stats: Arc::clone(&stats),
                };
                joins.push(tokio::spawn(slot.run(stop_rx.clone(), cancel_rx.clone())));
            }
        }

        info!(
            queues = ?config.queues.iter().map(QueueName::as_str).collect::<Vec<_>>(),
            concurrency = config.concurrency,
            "worker pool started"
        );
        Ok(Self {
            stop_tx,
            cancel_tx,
            joins,
            stats,
        })
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop taking new leases. In-flight handlers keep running.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.stop_tx.send(true);
    }

    /// Stops leasing, waits up to `grace` for in-flight jobs, then cancels the
    /// rest. Cancelled jobs are nacked without delay.
    pub async fn shutdown(self, grace: Duration) -> WorkerStatsSnapshot {
        self.request_shutdown();
        let deadline = tokio::time::Instant::now() + grace;

        let mut cancelled = false;
        for mut join in self.joins {
            if !cancelled && tokio::time::timeout_at(deadline, &mut join).await.is_ok() {
                continue;
            }
            if !cancelled {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "grace period over, cancelling in-flight jobs"
                );
                let _ = self.cancel_tx.send(true);
                cancelled = true;
            }
            if let Err(e) = join.await {
                warn!(error = %e, "worker slot ended abnormally");
            }
        }

        let stats = self.stats.snapshot();
        info!(?stats, "worker pool stopped");
        stats
    }
}

struct Slot {
    name: String,
    queue: QueueName,
    lease_wait: Duration,
    broker_backoff: RetryPolicy,
    deps: WorkerDeps,
    stats: Arc<WorkerStats>,
}

impl Slot {
    async fn run(self, mut stop_rx: watch::Receiver<bool>, mut cancel_rx: watch::Receiver<bool>) {
        let mut broker_failures: u32 = 0;
        loop {
            if *stop_rx.borrow() {
                break;
            }

            // lease は待つ可能性があるので stop と競合させる
            let leased = tokio::select! {
                _ = stopped(&mut stop_rx) => break,
                leased = self.deps.broker.lease(&self.queue, 1, self.lease_wait) => leased,
            };

            match leased {
                Ok(leases) => {
                    broker_failures = 0;
                    for lease in leases {
                        self.process(lease, &mut cancel_rx).await;
                    }
                }
                Err(err) => {
                    self.stats.record_broker_error();
                    let delay = self.broker_backoff.backoff(broker_failures);
                    broker_failures = broker_failures.saturating_add(1);
                    warn!(
                        slot = %self.name,
                        error = %err,
                        attempt = broker_failures,
                        delay_ms = delay.as_millis() as u64,
                        "lease failed, backing off"
                    );
                    tokio::select! {
                        _ = stopped(&mut stop_rx) => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!(slot = %self.name, "worker slot stopped");
    }

    async fn process(&self, lease: Lease, cancel_rx: &mut watch::Receiver<bool>) {
        let Lease {
            envelope,
            token,
            expires_at,
        } = lease;
        self.deps.events.emit(DomainEvent::JobLeased {
            job_id: envelope.id,
            queue: envelope.queue.clone(),
            delivery_count: envelope.delivery_count,
        });

        // lease 期限切れで戻ってきた分も予算に数える
        if envelope.over_budget() {
            let error = format!(
                "retry budget exhausted after {} deliveries without completion",
                envelope.delivery_count
            );
            self.fail_terminal(&envelope, token, error).await;
            return;
        }

        // handler は別タスクで走らせる（panic しても slot は生き残る）
        let runtime = Arc::clone(&self.deps.runtime);
        let job = envelope.clone();
        let mut handle = tokio::spawn(async move { runtime.execute(&job).await });

        let outcome = tokio::select! {
            joined = &mut handle => Outcome::Finished(joined.unwrap_or_else(|e| {
                Err(WeaverError::handler(format!("handler task failed: {e}")))
            })),
            _ = cancelled(cancel_rx) => {
                handle.abort();
                Outcome::Cancelled
            }
            _ = self.keep_lease(&envelope, token, expires_at) => {
                handle.abort();
                Outcome::LeaseLost
            }
        };

        match outcome {
            Outcome::Finished(Ok(())) => self.complete(&envelope, token).await,
            Outcome::Finished(Err(err)) if err.is_permanent() || envelope.retries_exhausted() => {
                self.fail_terminal(&envelope, token, err.to_string()).await;
            }
            Outcome::Finished(Err(err)) => self.retry(&envelope, token, err.to_string()).await,
            Outcome::LeaseLost => {
                // 別の delivery が持っている。ack / nack / dead-letter はどれも通らない
                self.stats.record_lease_lost();
                warn!(slot = %self.name, job_id = %envelope.id, "lease lost, handler abandoned");
            }
            Outcome::Cancelled => {
                self.stats.record_cancelled();
                if let Err(e) = self
                    .deps
                    .broker
                    .nack(envelope.id, token, Duration::ZERO, "cancelled by shutdown")
                    .await
                {
                    warn!(slot = %self.name, job_id = %envelope.id, error = %e, "nack after cancel failed");
                }
            }
        }
    }

    /// Renews the lease at a third of its remaining time while the handler runs.
    /// Returns only when the lease is gone.
    async fn keep_lease(
        &self,
        envelope: &JobEnvelope,
        token: LeaseToken,
        mut expires_at: DateTime<Utc>,
    ) {
        loop {
            let ttl = elapsed(self.deps.clock.now(), expires_at).max(MIN_LEASE_TTL);
            tokio::time::sleep(ttl / 3).await;

            match self.deps.broker.extend_lease(envelope.id, token).await {
                Ok(extended) => {
                    debug!(slot = %self.name, job_id = %envelope.id, %extended, "lease extended");
                    expires_at = extended;
                }
                Err(WeaverError::LeaseExpired { .. }) => return,
                Err(err) => {
                    // 期限内ならまだ間に合う。次の周期で再試行
                    self.stats.record_broker_error();
                    warn!(slot = %self.name, job_id = %envelope.id, error = %err, "lease extension failed");
                }
            }
        }
    }

    async fn complete(&self, envelope: &JobEnvelope, token: LeaseToken) {
        let result = ExecutionResult::success(envelope, self.deps.clock.now());
        match self.deps.results.record_result(&result).await {
            Ok(written) => {
                if !written {
                    debug!(job_id = %envelope.id, "result already recorded by an earlier delivery");
                }
            }
            Err(err) => {
                self.retry(envelope, token, format!("recording result failed: {err}")).await;
                return;
            }
        }

        if let Err(e) = self.deps.broker.ack(envelope.id, token).await {
            // 結果は記録済み。再配送されても insert-if-absent で重複しない
            warn!(slot = %self.name, job_id = %envelope.id, error = %e, "ack failed");
            return;
        }
        self.stats.record_success();
        self.deps.events.emit(DomainEvent::JobSucceeded {
            job_id: envelope.id,
            queue: envelope.queue.clone(),
            delivery_count: envelope.delivery_count,
        });
    }

    async fn retry(&self, envelope: &JobEnvelope, token: LeaseToken, error: String) {
        let delay = envelope.next_retry_delay();
        if let Err(e) = self.deps.broker.nack(envelope.id, token, delay, &error).await {
            warn!(slot = %self.name, job_id = %envelope.id, error = %e, "nack failed");
            return;
        }
        self.stats.record_retry();
        self.deps.events.emit(DomainEvent::RetryScheduled {
            job_id: envelope.id,
            queue: envelope.queue.clone(),
            delivery_count: envelope.delivery_count,
            delay,
            error,
        });
    }

    async fn fail_terminal(&self, envelope: &JobEnvelope, token: LeaseToken, error: String) {
        let result = ExecutionResult::failure(envelope, error.clone(), self.deps.clock.now());
        if let Err(err) = self.deps.results.record_result(&result).await {
            self.retry(envelope, token, format!("recording failure failed: {err}")).await;
            return;
        }

        if let Err(e) = self.deps.broker.dead_letter(envelope.id, token, &error).await {
            warn!(slot = %self.name, job_id = %envelope.id, error = %e, "dead-letter failed");
            return;
        }
        self.stats.record_dead_letter();
        self.deps.events.emit(DomainEvent::JobDeadLettered {
            job_id: envelope.id,
            queue: envelope.queue.clone(),
            delivery_count: envelope.delivery_count,
            error,
        });
    }
}

enum Outcome {
    Finished(Result<(), WeaverError>),
    Cancelled,
    LeaseLost,
}

/// Resolves once stop was requested or the pool handle is gone.
pub(crate) async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Resolves once cancel was sent. A dropped sender never cancels.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancel| *cancel).await.is_err() {
        std::future::pending::<()>().await;
    }
}
