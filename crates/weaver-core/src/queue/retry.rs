//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::domain::JobId;

/// Exponential backoff with a ceiling and optional deterministic jitter.
///
/// Travels inside every envelope, so a job keeps the policy it was enqueued with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed delivery.
    pub base_delay: Duration,

    /// Growth factor per additional delivery.
    pub multiplier: f64,

    /// Ceiling for any computed delay.
    pub max_delay: Duration,

    /// When set, the delay is drawn from `[backoff / 2, backoff]`.
    pub jitter: bool,
}

impl RetryPolicy {
    /// base 2s, x2 per delivery, capped at 10 minutes, jittered.
    pub fn default_v1() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(600),
            jitter: true,
        }
    }

    /// No waiting between deliveries. Useful for tests and demos.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Un-jittered delay after the delivery numbered `delivery_count` failed.
    ///
    /// `base_delay * multiplier^delivery_count`, clamped to `max_delay`:
    /// - count 0 (first delivery failed): 2s
    /// - count 1: 4s
    /// - count 2: 8s
    pub fn backoff(&self, delivery_count: u32) -> Duration {
        let exponent = delivery_count.min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(0.0).powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Delay actually used for a nack. Pure in `(job_id, delivery_count)`.
    pub fn delay_for(&self, job_id: JobId, delivery_count: u32) -> Duration {
        let ceiling = self.backoff(delivery_count);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }

        let floor = ceiling / 2;
        let spread = (ceiling - floor).as_nanos().min(u128::from(u64::MAX)) as u64;
        let mut rng = StdRng::seed_from_u64(jitter_seed(job_id, delivery_count));
        floor + Duration::from_nanos(rng.gen_range(0..=spread))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_v1()
    }
}

fn jitter_seed(job_id: JobId, delivery_count: u32) -> u64 {
    let raw = job_id.as_ulid().0;
    ((raw >> 64) as u64) ^ (raw as u64) ^ u64::from(delivery_count).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}
