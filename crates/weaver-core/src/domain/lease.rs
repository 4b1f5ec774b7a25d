use chrono::{DateTime, Utc};

use super::envelope::JobEnvelope;
use super::ids::{JobId, LeaseToken};

/// Time-bounded ownership of one envelope by one worker.
///
/// Only the holder of `token` may ack, nack or dead-letter the envelope, and only
/// until `expires_at`. After that the broker may hand it to someone else.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub envelope: JobEnvelope,
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn job_id(&self) -> JobId {
        self.envelope.id
    }
}
