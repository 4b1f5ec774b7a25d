//! Producer - enqueue 側の入り口
//!
//! 検証エラーは即座に返す。broker が落ちている間だけ backoff して再試行する。

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::domain::{DomainEvent, EnqueueOptions, JobId, NewJob, QueueName};
use crate::error::WeaverError;
use crate::ports::{Broker, EventSink, NoopEventSink};
use crate::queue::RetryPolicy;
use crate::typed::{PayloadCodec, Task};

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerConfig {
    /// Total enqueue attempts while the broker is unavailable.
    pub max_attempts: u32,
    pub backoff: RetryPolicy,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: RetryPolicy::default_v1()
                .with_base_delay(Duration::from_millis(200))
                .with_max_delay(Duration::from_secs(5))
                .with_jitter(false),
        }
    }
}

impl ProducerConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

pub struct Producer {
    broker: Arc<dyn Broker>,
    events: Arc<dyn EventSink>,
    config: ProducerConfig,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            events: Arc::new(NoopEventSink),
            config: ProducerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ProducerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub async fn enqueue(&self, job: NewJob) -> Result<JobId, WeaverError> {
        job.validate()?;

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            let queue = job.queue.clone();
            let handler = job.handler.clone();
            match self.broker.enqueue(job.clone()).await {
                Ok(job_id) => {
                    self.events.emit(DomainEvent::JobEnqueued {
                        job_id,
                        queue,
                        handler,
                    });
                    return Ok(job_id);
                }
                Err(WeaverError::BrokerUnavailable(reason)) if attempt + 1 < max_attempts => {
                    let delay = self.config.backoff.backoff(attempt);
                    attempt += 1;
                    warn!(
                        queue = %queue,
                        handler = %handler,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "broker unavailable, retrying enqueue"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Encodes `task` as JSON and enqueues it under `T::TYPE`.
    pub async fn enqueue_task<T: Task>(
        &self,
        queue: impl Into<QueueName>,
        task: &T,
        options: EnqueueOptions,
    ) -> Result<JobId, WeaverError> {
        let payload = PayloadCodec::encode(task)?;
        self.enqueue(NewJob::new(queue, T::TYPE, payload).with_options(options))
            .await
    }
}
