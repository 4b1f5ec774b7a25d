//! Queue module: delivery state, retry policy, and the in-memory broker.

mod memory;
mod record;
mod retry;
mod state;

pub use memory::InMemoryBroker;
pub use record::{ActiveLease, JobRecord};
pub use retry::RetryPolicy;
pub use state::DeliveryState;

use std::time::Duration;

use crate::domain::JobDefaults;

/// Broker-side settings shared by every adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerConfig {
    /// How long a lease stays valid without ack/nack.
    pub visibility_timeout: Duration,

    /// Applied to jobs that do not override them.
    pub defaults: JobDefaults,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            defaults: JobDefaults::default(),
        }
    }
}

impl BrokerConfig {
    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.defaults.max_retries = max_retries;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.defaults.retry = retry;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.defaults.timeout = Some(timeout);
        self
    }
}
