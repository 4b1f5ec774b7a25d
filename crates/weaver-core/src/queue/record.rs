//! Broker record: envelope + delivery metadata.

use tokio::time::Instant;

use super::DeliveryState;
use crate::domain::{JobEnvelope, LeaseToken};

/// Lease currently held on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveLease {
    pub token: LeaseToken,
    pub expires_at: Instant,
}

/// Metadata + envelope for a job inside the broker.
///
/// Design:
/// - Single source of truth for delivery state.
/// - Queue structures (ready/delayed/leases) hold ids only and may go stale;
///   every transition is validated against this record.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub envelope: JobEnvelope,
    pub state: DeliveryState,
    pub lease: Option<ActiveLease>,

    /// Last error reported through nack.
    pub last_error: Option<String>,
}

impl JobRecord {
    pub fn ready(envelope: JobEnvelope) -> Self {
        Self {
            envelope,
            state: DeliveryState::Ready,
            lease: None,
            last_error: None,
        }
    }

    pub fn delayed(envelope: JobEnvelope) -> Self {
        Self {
            state: DeliveryState::Delayed,
            ..Self::ready(envelope)
        }
    }

    /// Does `token` hold a live lease on this record at `now`?
    pub fn held_by(&self, token: LeaseToken, now: Instant) -> bool {
        self.state == DeliveryState::Leased
            && self
                .lease
                .is_some_and(|lease| lease.token == token && lease.expires_at > now)
    }

    pub fn start_lease(&mut self, token: LeaseToken, expires_at: Instant) {
        self.state = DeliveryState::Leased;
        self.lease = Some(ActiveLease { token, expires_at });
    }

    /// Moves the deadline of the current lease.
    pub fn extend_lease(&mut self, expires_at: Instant) {
        if let Some(lease) = self.lease.as_mut() {
            lease.expires_at = expires_at;
        }
    }

    /// Lease ran out without ack/nack. Counts as a redelivery.
    pub fn expire_lease(&mut self) {
        self.state = DeliveryState::Ready;
        self.lease = None;
        self.envelope.delivery_count += 1;
    }

    /// Failed delivery returned by its holder.
    pub fn schedule_retry(&mut self, delayed: bool, error: String) {
        self.state = if delayed {
            DeliveryState::Delayed
        } else {
            DeliveryState::Ready
        };
        self.lease = None;
        self.last_error = Some(error);
        self.envelope.delivery_count += 1;
    }

    /// Move from Delayed back to Ready.
    pub fn requeue(&mut self) {
        self.state = DeliveryState::Ready;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobDefaults, JobId, NewJob};
    use chrono::Utc;
    use std::time::Duration;

    fn record() -> JobRecord {
        let env = NewJob::new("q", "h", serde_json::json!({})).into_envelope(
            JobId::generate(),
            Utc::now(),
            &JobDefaults::default(),
        );
        JobRecord::ready(env)
    }

    #[test]
    fn lease_is_held_only_by_its_token_until_expiry() {
        let mut rec = record();
        let now = Instant::now();
        let token = LeaseToken::generate();
        rec.start_lease(token, now + Duration::from_secs(30));

        assert!(rec.held_by(token, now));
        assert!(!rec.held_by(LeaseToken::generate(), now));
        assert!(!rec.held_by(token, now + Duration::from_secs(30)));

        rec.extend_lease(now + Duration::from_secs(60));
        assert!(rec.held_by(token, now + Duration::from_secs(30)));
    }

    #[test]
    fn expiry_and_retry_count_as_redeliveries() {
        let mut rec = record();
        rec.start_lease(LeaseToken::generate(), Instant::now());
        rec.expire_lease();
        assert_eq!(rec.state, DeliveryState::Ready);
        assert_eq!(rec.envelope.delivery_count, 1);

        rec.start_lease(LeaseToken::generate(), Instant::now());
        rec.schedule_retry(true, "boom".into());
        assert_eq!(rec.state, DeliveryState::Delayed);
        assert_eq!(rec.envelope.delivery_count, 2);
        assert_eq!(rec.last_error.as_deref(), Some("boom"));
        assert!(rec.lease.is_none());
    }
}
