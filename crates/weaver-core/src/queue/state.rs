//! Delivery state machine for the in-memory broker.

use serde::{Deserialize, Serialize};

/// Where an envelope sits inside the broker.
///
/// State transitions:
/// - Ready -> Leased -> (ack: removed)
/// - Ready -> Leased -> Delayed -> Ready (nack with delay)
/// - Ready -> Leased -> Ready (nack without delay, or lease expiry)
/// - Delayed -> Ready (delayed enqueue)
///
/// Dead-lettered envelopes leave the record map for the dead-letter sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Eligible for lease.
    Ready,

    /// Invisible until its delay elapses.
    Delayed,

    /// Held by exactly one worker.
    Leased,
}

impl DeliveryState {
    pub fn is_leasable(self) -> bool {
        matches!(self, DeliveryState::Ready)
    }
}
