//! JobEnvelope - broker が運ぶ作業単位
//!
//! producer / scheduler は `NewJob` を渡し、broker が id と時刻を付けて
//! `JobEnvelope` にする。envelope は ack されるまで broker が所有する。

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::time::add_std;
use crate::error::WeaverError;
use crate::queue::RetryPolicy;

/// Largest serialized payload accepted at enqueue time.
pub const MAX_PAYLOAD_BYTES: usize = 256 * 1024;

const MAX_NAME_LEN: usize = 128;

fn validate_name(what: &str, name: &str) -> Result<(), WeaverError> {
    if name.is_empty() {
        return Err(WeaverError::validation(format!("{what} name must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(WeaverError::validation(format!(
            "{what} name longer than {MAX_NAME_LEN} characters"
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')))
    {
        return Err(WeaverError::validation(format!(
            "{what} name `{name}` contains invalid character {bad:?}"
        )));
    }
    Ok(())
}

/// Name of a queue on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> Result<(), WeaverError> {
        validate_name("queue", &self.0)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for QueueName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Identifier a worker resolves to a registered handler.
///
/// 命名規約: `{namespace}.{action}` 例: `urlshortener.log_click`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(String);

impl HandlerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> Result<(), WeaverError> {
        validate_name("handler", &self.0)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for HandlerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Per-job overrides supplied by the producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Deliver no earlier than now + delay.
    pub delay: Option<Duration>,
    pub max_retries: Option<u32>,
    /// Execution deadline for each delivery.
    pub timeout: Option<Duration>,
    pub retry: Option<RetryPolicy>,
}

impl EnqueueOptions {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

/// Broker-wide defaults applied where the producer gave no override.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefaults {
    pub max_retries: u32,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry: RetryPolicy::default_v1(),
            timeout: None,
        }
    }
}

/// A job as requested by a producer, before the broker accepts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub queue: QueueName,
    pub handler: HandlerId,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub options: EnqueueOptions,
}

impl NewJob {
    pub fn new(
        queue: impl Into<QueueName>,
        handler: impl Into<HandlerId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            queue: queue.into(),
            handler: handler.into(),
            payload,
            options: EnqueueOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EnqueueOptions) -> Self {
        self.options = options;
        self
    }

    /// Malformed jobs are rejected here and never reach the broker.
    pub fn validate(&self) -> Result<(), WeaverError> {
        self.queue.validate()?;
        self.handler.validate()?;

        let size = serde_json::to_vec(&self.payload)?.len();
        if size > MAX_PAYLOAD_BYTES {
            return Err(WeaverError::validation(format!(
                "payload is {size} bytes, limit is {MAX_PAYLOAD_BYTES}"
            )));
        }
        if self.options.timeout.is_some_and(|t| t.is_zero()) {
            return Err(WeaverError::validation("timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn into_envelope(self, id: JobId, now: DateTime<Utc>, defaults: &JobDefaults) -> JobEnvelope {
        let available_at = match self.options.delay {
            Some(delay) => add_std(now, delay),
            None => now,
        };
        JobEnvelope {
            id,
            queue: self.queue,
            handler: self.handler,
            payload: self.payload,
            enqueued_at: now,
            available_at,
            delivery_count: 0,
            generation: 0,
            max_retries: self.options.max_retries.unwrap_or(defaults.max_retries),
            retry: self.options.retry.unwrap_or_else(|| defaults.retry.clone()),
            timeout: self.options.timeout.or(defaults.timeout),
        }
    }
}

/// The unit of work transported through the broker.
///
/// `id` is stable across redeliveries; `delivery_count` starts at 0 and grows by
/// one per redelivery (nack or lease expiry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: JobId,
    pub queue: QueueName,
    pub handler: HandlerId,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub delivery_count: u32,
    /// Bumped by every dead-letter replay. Results are keyed by (id, generation).
    #[serde(default)]
    pub generation: u32,
    pub max_retries: u32,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
}

impl JobEnvelope {
    /// A failure of this delivery is terminal.
    pub fn retries_exhausted(&self) -> bool {
        self.delivery_count >= self.max_retries
    }

    /// Redelivered past the budget without a recorded failure (lease expiry loop).
    pub fn over_budget(&self) -> bool {
        self.delivery_count > self.max_retries
    }

    /// Backoff before the next delivery if this one fails.
    pub fn next_retry_delay(&self) -> Duration {
        self.retry.delay_for(self.id, self.delivery_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use rstest::rstest;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[rstest]
    #[case::empty("")]
    #[case::space("my queue")]
    #[case::slash("a/b")]
    #[case::too_long(&"q".repeat(129))]
    fn invalid_queue_names_are_rejected(#[case] name: &str) {
        let job = NewJob::new(name, "h", json!({}));
        assert_matches!(job.validate(), Err(WeaverError::Validation(_)));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let job = NewJob::new("emails", "mail.send", json!("x".repeat(MAX_PAYLOAD_BYTES)));
        assert_matches!(job.validate(), Err(WeaverError::Validation(msg)) if msg.contains("payload"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let job = NewJob::new("emails", "mail.send", json!({}))
            .with_options(EnqueueOptions::default().with_timeout(Duration::ZERO));
        assert!(job.validate().is_err());
    }

    #[test]
    fn into_envelope_applies_defaults_and_delay() {
        let defaults = JobDefaults::default();
        let id = JobId::generate();
        let job = NewJob::new("emails", "mail.send", json!("welcome:user42"))
            .with_options(EnqueueOptions::default().with_delay(Duration::from_secs(30)));

        let env = job.into_envelope(id, t0(), &defaults);

        assert_eq!(env.id, id);
        assert_eq!(env.delivery_count, 0);
        assert_eq!(env.generation, 0);
        assert_eq!(env.max_retries, 3);
        assert_eq!(env.enqueued_at, t0());
        assert_eq!(env.available_at, t0() + chrono::TimeDelta::seconds(30));
        assert_eq!(env.retry, RetryPolicy::default_v1());
    }

    #[test]
    fn overrides_win_over_defaults() {
        let defaults = JobDefaults::default();
        let job = NewJob::new("emails", "mail.send", json!({})).with_options(
            EnqueueOptions::default()
                .with_max_retries(2)
                .with_timeout(Duration::from_secs(5))
                .with_retry(RetryPolicy::immediate()),
        );

        let env = job.into_envelope(JobId::generate(), t0(), &defaults);

        assert_eq!(env.max_retries, 2);
        assert_eq!(env.timeout, Some(Duration::from_secs(5)));
        assert_eq!(env.retry, RetryPolicy::immediate());
    }

    #[rstest]
    #[case(0, 2, false, false)]
    #[case(2, 2, true, false)]
    #[case(3, 2, true, true)]
    fn budget_checks(
        #[case] delivery_count: u32,
        #[case] max_retries: u32,
        #[case] exhausted: bool,
        #[case] over: bool,
    ) {
        let mut env = NewJob::new("q", "h", json!(null)).into_envelope(
            JobId::generate(),
            t0(),
            &JobDefaults::default(),
        );
        env.delivery_count = delivery_count;
        env.max_retries = max_retries;

        assert_eq!(env.retries_exhausted(), exhausted);
        assert_eq!(env.over_budget(), over);
    }
}
