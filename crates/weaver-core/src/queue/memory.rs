//! In-memory broker implementation.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::{BrokerConfig, DeliveryState, JobRecord};
use crate::app::status::QueueCounts;
use crate::domain::time::add_std;
use crate::domain::{DeadLetterEntry, JobId, Lease, LeaseToken, NewJob, QueueName};
use crate::error::WeaverError;
use crate::ports::{Broker, Clock, IdGenerator, SystemClock, UlidGenerator};

/// Heap entry ordered by time.
///
/// Reverse ordering so BinaryHeap acts as a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Timed<T> {
    at: Instant,
    item: T,
}

impl<T: Ord> PartialOrd for Timed<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for Timed<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.item.cmp(&self.item))
    }
}

#[derive(Default)]
struct InMemoryBrokerState {
    /// All live records (single source of truth).
    records: HashMap<JobId, JobRecord>,

    /// Ready queues (JobIds only).
    ready: HashMap<QueueName, VecDeque<JobId>>,

    /// Delayed deliveries (nack with delay, delayed enqueue).
    delayed: BinaryHeap<Timed<JobId>>,

    /// Lease deadlines. Entries go stale after ack/nack and are skipped.
    leases: BinaryHeap<Timed<(JobId, LeaseToken)>>,

    /// Dead-letter sink, oldest first.
    dead: Vec<DeadLetterEntry>,
}

impl InMemoryBrokerState {
    /// Promote due delays and reclaim expired leases.
    fn refresh(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.peek() {
            if entry.at > now {
                break; // Heap is sorted, so we can stop
            }
            let Some(entry) = self.delayed.pop() else {
                break;
            };
            if let Some(record) = self.records.get_mut(&entry.item)
                && record.state == DeliveryState::Delayed
            {
                record.requeue();
                let queue = record.envelope.queue.clone();
                self.ready.entry(queue).or_default().push_back(entry.item);
            }
        }

        while let Some(entry) = self.leases.peek() {
            if entry.at > now {
                break;
            }
            let Some(entry) = self.leases.pop() else {
                break;
            };
            let (job_id, token) = entry.item;
            // 延長された lease の古い期限エントリは読み飛ばす
            if let Some(record) = self.records.get_mut(&job_id)
                && record
                    .lease
                    .is_some_and(|lease| lease.token == token && lease.expires_at <= now)
            {
                record.expire_lease();
                debug!(
                    job_id = %job_id,
                    delivery_count = record.envelope.delivery_count,
                    "lease expired, envelope back on queue"
                );
                let queue = record.envelope.queue.clone();
                self.ready.entry(queue).or_default().push_back(job_id);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let delayed = self.delayed.peek().map(|e| e.at);
        let lease = self.leases.peek().map(|e| e.at);
        match (delayed, lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn holder_mut(
        &mut self,
        job_id: JobId,
        token: LeaseToken,
        now: Instant,
    ) -> Result<&mut JobRecord, WeaverError> {
        match self.records.get_mut(&job_id) {
            Some(record) if record.held_by(token, now) => Ok(record),
            _ => Err(WeaverError::LeaseExpired { job_id }),
        }
    }
}

/// In-memory broker. Shares nothing across processes; meant for tests, the
/// demo command and single-process embedding.
pub struct InMemoryBroker {
    state: Arc<Mutex<InMemoryBrokerState>>,
    notify: Arc<Notify>,
    available: AtomicBool,
    config: BrokerConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl InMemoryBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BrokerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryBrokerState::default())),
            notify: Arc::new(Notify::new()),
            available: AtomicBool::new(true),
            config,
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Simulate a transport outage: while unavailable every call fails with
    /// `BrokerUnavailable`. State is kept.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if available {
            self.notify.notify_waiters();
        }
    }

    fn ensure_available(&self) -> Result<(), WeaverError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WeaverError::BrokerUnavailable(
                "in-memory broker is offline".to_string(),
            ))
        }
    }

    fn take_ready(
        &self,
        state: &mut InMemoryBrokerState,
        queue: &QueueName,
        count: usize,
        now: Instant,
    ) -> Vec<Lease> {
        let visibility = self.config.visibility_timeout;
        let mut leased = Vec::new();
        while leased.len() < count {
            let Some(job_id) = state.ready.get_mut(queue).and_then(|q| q.pop_front()) else {
                break;
            };
            let Some(record) = state.records.get_mut(&job_id) else {
                continue;
            };
            if !record.state.is_leasable() {
                continue;
            }

            let token = self.ids.generate_lease_token();
            let deadline = now + visibility;
            record.start_lease(token, deadline);
            state.leases.push(Timed {
                at: deadline,
                item: (job_id, token),
            });
            leased.push(Lease {
                envelope: record.envelope.clone(),
                token,
                expires_at: add_std(self.clock.now(), visibility),
            });
        }
        leased
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, job: NewJob) -> Result<JobId, WeaverError> {
        self.ensure_available()?;
        job.validate()?;

        let delay = job.options.delay.filter(|d| !d.is_zero());
        let id = self.ids.generate_job_id();
        let envelope = job.into_envelope(id, self.clock.now(), &self.config.defaults);
        let queue = envelope.queue.clone();

        {
            let mut state = self.state.lock().await;
            match delay {
                Some(delay) => {
                    state.records.insert(id, JobRecord::delayed(envelope));
                    state.delayed.push(Timed {
                        at: Instant::now() + delay,
                        item: id,
                    });
                }
                None => {
                    state.records.insert(id, JobRecord::ready(envelope));
                    state.ready.entry(queue).or_default().push_back(id);
                }
            }
        }

        // Notify outside the lock
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn lease(
        &self,
        queue: &QueueName,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Lease>, WeaverError> {
        self.ensure_available()?;
        let count = count.max(1);
        let deadline = Instant::now() + timeout;

        loop {
            // notified() は lock 前に作る（notify_waiters の取りこぼし防止）
            let notified = self.notify.notified();

            let next_wake = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.refresh(now);

                let leased = self.take_ready(&mut state, queue, count, now);
                if !leased.is_empty() {
                    return Ok(leased);
                }
                state.next_wake()
            };

            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_wake.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = notified => {},
                _ = tokio::time::sleep_until(wake_at) => {},
            }
            self.ensure_available()?;
        }
    }

    async fn ack(&self, job_id: JobId, token: LeaseToken) -> Result<(), WeaverError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.refresh(now);
        state.holder_mut(job_id, token, now)?;
        state.records.remove(&job_id);
        Ok(())
    }

    async fn extend_lease(
        &self,
        job_id: JobId,
        token: LeaseToken,
    ) -> Result<DateTime<Utc>, WeaverError> {
        self.ensure_available()?;
        let visibility = self.config.visibility_timeout;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.refresh(now);

        let deadline = now + visibility;
        state.holder_mut(job_id, token, now)?.extend_lease(deadline);
        state.leases.push(Timed {
            at: deadline,
            item: (job_id, token),
        });
        Ok(add_std(self.clock.now(), visibility))
    }

    async fn nack(
        &self,
        job_id: JobId,
        token: LeaseToken,
        delay: Duration,
        error: &str,
    ) -> Result<(), WeaverError> {
        self.ensure_available()?;
        {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            state.refresh(now);

            let record = state.holder_mut(job_id, token, now)?;
            let delayed = !delay.is_zero();
            record.schedule_retry(delayed, error.to_string());
            record.envelope.available_at = add_std(self.clock.now(), delay);
            let queue = record.envelope.queue.clone();

            if delayed {
                state.delayed.push(Timed {
                    at: now + delay,
                    item: job_id,
                });
            } else {
                state.ready.entry(queue).or_default().push_back(job_id);
            }
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        job_id: JobId,
        token: LeaseToken,
        error: &str,
    ) -> Result<(), WeaverError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.refresh(now);

        state.holder_mut(job_id, token, now)?;
        if let Some(record) = state.records.remove(&job_id) {
            state.dead.push(DeadLetterEntry {
                envelope: record.envelope,
                error: error.to_string(),
                dead_lettered_at: self.clock.now(),
            });
        }
        Ok(())
    }

    async fn dead_letters(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, WeaverError> {
        self.ensure_available()?;
        let state = self.state.lock().await;
        Ok(state
            .dead
            .iter()
            .filter(|entry| &entry.envelope.queue == queue)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replay_dead_letter(&self, job_id: JobId) -> Result<(), WeaverError> {
        self.ensure_available()?;
        {
            let mut state = self.state.lock().await;
            let Some(pos) = state.dead.iter().position(|e| e.envelope.id == job_id) else {
                return Err(WeaverError::validation(format!(
                    "{job_id} is not in the dead-letter sink"
                )));
            };
            let mut envelope = state.dead.remove(pos).envelope;
            envelope.delivery_count = 0;
            envelope.generation += 1;
            envelope.available_at = self.clock.now();

            let queue = envelope.queue.clone();
            state.records.insert(job_id, JobRecord::ready(envelope));
            state.ready.entry(queue).or_default().push_back(job_id);
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn counts(&self, queue: &QueueName) -> Result<QueueCounts, WeaverError> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        state.refresh(Instant::now());

        let mut counts = QueueCounts::default();
        for record in state.records.values().filter(|r| &r.envelope.queue == queue) {
            match record.state {
                DeliveryState::Ready => counts.ready += 1,
                DeliveryState::Delayed => counts.delayed += 1,
                DeliveryState::Leased => counts.leased += 1,
            }
        }
        counts.dead += state
            .dead
            .iter()
            .filter(|e| &e.envelope.queue == queue)
            .count() as u64;
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), WeaverError> {
        self.ensure_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EnqueueOptions;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn emails() -> QueueName {
        QueueName::new("emails")
    }

    fn broker() -> InMemoryBroker {
        InMemoryBroker::new(BrokerConfig::default().with_visibility_timeout(Duration::from_secs(30)))
    }

    async fn lease_one(broker: &InMemoryBroker) -> Lease {
        let mut leases = broker
            .lease(&emails(), 1, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(leases.len(), 1, "expected exactly one lease");
        leases.remove(0)
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_and_counts() {
        let broker = broker();
        broker
            .enqueue(NewJob::new("emails", "mail.send", json!("welcome:user42")))
            .await
            .unwrap();

        let counts = broker.counts(&emails()).await.unwrap();
        assert_eq!(counts.ready, 1);
        assert_eq!(counts.leased, 0);
        assert_eq!(broker.counts(&QueueName::new("other")).await.unwrap().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_jobs_are_never_enqueued() {
        let broker = broker();
        let err = broker
            .enqueue(NewJob::new("emails", "bad handler", json!({})))
            .await
            .unwrap_err();

        assert_matches!(err, WeaverError::Validation(_));
        assert_eq!(broker.counts(&emails()).await.unwrap().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_times_out_with_empty_list() {
        let broker = broker();
        let started = Instant::now();

        let leases = broker.lease(&emails(), 4, Duration::from_secs(5)).await.unwrap();

        assert!(leases.is_empty());
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn lease_wakes_up_on_enqueue() {
        let broker = Arc::new(broker());
        let waiter = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.lease(&emails(), 1, Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;

        let id = broker
            .enqueue(NewJob::new("emails", "mail.send", json!({})))
            .await
            .unwrap();

        let leases = waiter.await.unwrap().unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].job_id(), id);
        assert_eq!(leases[0].envelope.delivery_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_respects_count() {
        let broker = broker();
        for i in 0..3 {
            broker
                .enqueue(NewJob::new("emails", "mail.send", json!(i)))
                .await
                .unwrap();
        }

        let leases = broker.lease(&emails(), 2, Duration::from_secs(1)).await.unwrap();
        assert_eq!(leases.len(), 2);
        assert_eq!(broker.counts(&emails()).await.unwrap().leased, 2);
        assert_eq!(broker.counts(&emails()).await.unwrap().ready, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leases_are_exclusive_until_visibility_timeout() {
        let broker = Arc::new(broker());
        broker
            .enqueue(NewJob::new("emails", "mail.send", json!("welcome:user42")))
            .await
            .unwrap();

        let first = lease_one(&broker).await;

        // 2 つ目の worker は同じ envelope を取れない
        let second = broker.lease(&emails(), 1, Duration::from_secs(10)).await.unwrap();
        assert!(second.is_empty());

        // visibility timeout 経過後は再配送される
        let second = broker.lease(&emails(), 1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].job_id(), first.job_id());
        assert_eq!(second[0].envelope.delivery_count, 1);
        assert_ne!(second[0].token, first.token);

        // 元の holder はもう ack できない
        let err = broker.ack(first.job_id(), first.token).await.unwrap_err();
        assert_matches!(err, WeaverError::LeaseExpired { .. });
        broker.ack(second[0].job_id(), second[0].token).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn extended_lease_outlives_the_visibility_timeout() {
        let broker = broker();
        broker
            .enqueue(NewJob::new("emails", "mail.send", json!({})))
            .await
            .unwrap();
        let lease = lease_one(&broker).await;

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            broker.extend_lease(lease.job_id(), lease.token).await.unwrap();
        }

        // 元の visibility timeout を何度過ぎても再配送されない
        assert!(broker.lease(&emails(), 1, Duration::from_secs(15)).await.unwrap().is_empty());
        broker.ack(lease.job_id(), lease.token).await.unwrap();
        assert_eq!(broker.counts(&emails()).await.unwrap().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_cannot_be_extended() {
        let broker = broker();
        broker
            .enqueue(NewJob::new("emails", "mail.send", json!({})))
            .await
            .unwrap();
        let lease = lease_one(&broker).await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_matches!(
            broker.extend_lease(lease.job_id(), lease.token).await,
            Err(WeaverError::LeaseExpired { .. })
        );
        let again = lease_one(&broker).await;
        assert_eq!(again.envelope.delivery_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_removes_the_envelope() {
        let broker = broker();
        broker
            .enqueue(NewJob::new("emails", "mail.send", json!({})))
            .await
            .unwrap();
        let lease = lease_one(&broker).await;

        broker.ack(lease.job_id(), lease.token).await.unwrap();

        assert_eq!(broker.counts(&emails()).await.unwrap().total(), 0);
        assert_matches!(
            broker.ack(lease.job_id(), lease.token).await,
            Err(WeaverError::LeaseExpired { .. })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn nack_redelivers_after_delay_with_incremented_count() {
        let broker = broker();
        broker
            .enqueue(NewJob::new("emails", "mail.send", json!({})))
            .await
            .unwrap();
        let lease = lease_one(&broker).await;

        broker
            .nack(lease.job_id(), lease.token, Duration::from_secs(10), "boom")
            .await
            .unwrap();
        assert_eq!(broker.counts(&emails()).await.unwrap().delayed, 1);

        let early = broker.lease(&emails(), 1, Duration::from_secs(9)).await.unwrap();
        assert!(early.is_empty());

        let again = lease_one(&broker).await;
        assert_eq!(again.job_id(), lease.job_id());
        assert_eq!(again.envelope.delivery_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_enqueue_is_invisible_until_due() {
        let broker = broker();
        broker
            .enqueue(
                NewJob::new("emails", "mail.send", json!({}))
                    .with_options(EnqueueOptions::default().with_delay(Duration::from_secs(30))),
            )
            .await
            .unwrap();

        assert_eq!(broker.counts(&emails()).await.unwrap().delayed, 1);
        assert!(broker.lease(&emails(), 1, Duration::from_secs(29)).await.unwrap().is_empty());
        let leases = broker.lease(&emails(), 1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].envelope.delivery_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_letter_and_replay() {
        let broker = broker();
        let id = broker
            .enqueue(NewJob::new("emails", "mail.send", json!({})))
            .await
            .unwrap();
        let lease = lease_one(&broker).await;
        broker.nack(lease.job_id(), lease.token, Duration::ZERO, "first").await.unwrap();
        let lease = lease_one(&broker).await;

        broker.dead_letter(id, lease.token, "gave up").await.unwrap();

        let dead = broker.dead_letters(&emails(), 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error, "gave up");
        assert_eq!(dead[0].envelope.delivery_count, 1);
        let counts = broker.counts(&emails()).await.unwrap();
        assert_eq!((counts.ready, counts.dead), (0, 1));

        broker.replay_dead_letter(id).await.unwrap();
        let replayed = lease_one(&broker).await;
        assert_eq!(replayed.job_id(), id);
        assert_eq!(replayed.envelope.delivery_count, 0);
        assert_eq!(replayed.envelope.generation, 1);
        assert!(broker.dead_letters(&emails(), 10).await.unwrap().is_empty());
        assert_matches!(broker.replay_dead_letter(id).await, Err(WeaverError::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn offline_broker_reports_unavailable() {
        let broker = broker();
        broker.set_available(false);

        assert_matches!(
            broker.enqueue(NewJob::new("emails", "mail.send", json!({}))).await,
            Err(WeaverError::BrokerUnavailable(_))
        );
        assert_matches!(
            broker.lease(&emails(), 1, Duration::from_secs(1)).await,
            Err(WeaverError::BrokerUnavailable(_))
        );
        assert_matches!(broker.ping().await, Err(WeaverError::BrokerUnavailable(_)));

        broker.set_available(true);
        broker.ping().await.unwrap();
    }
}
