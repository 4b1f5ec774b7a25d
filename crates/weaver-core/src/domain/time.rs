//! std::time::Duration と chrono の橋渡し

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// `at + delay`, saturating at the largest representable instant.
pub fn add_std(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Elapsed time between two instants, zero when `to` is not after `from`.
pub fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}
