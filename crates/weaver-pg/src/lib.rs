//! weaver-pg
//!
//! PostgreSQL adapters for the weaver ports.
//!
//! - **PgBroker**: Broker（`weaver_jobs`、`FOR UPDATE SKIP LOCKED` で lease）
//! - **PgDatastore**: ResultStore / ScheduleStore / HealthProbe
//! - **PgSchedulerLock**: SchedulerLock（`pg_try_advisory_lock`）
//!
//! ## Error Mapping
//!
//! | sqlx error | broker side | datastore side |
//! |---|---|---|
//! | `PoolTimedOut`, `PoolClosed`, `Io`, `Tls` | `BrokerUnavailable` | `Datastore` |
//! | anything else | `Datastore` | `Datastore` |

mod broker;
mod datastore;
mod lock;

pub use self::broker::PgBroker;
pub use self::datastore::PgDatastore;
pub use self::lock::{PgSchedulerLock, SCHEDULER_LOCK_KEY};

use std::time::Duration;

use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use weaver_core::WeaverError;

/// Embedded schema migrations.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Clone, PartialEq)]
pub struct PgConfig {
    pub database_url: String,
    pub max_connections: u32,

    /// Also the pool acquire timeout.
    pub connect_timeout: Duration,

    /// Broker polling interval while a queue is empty.
    pub poll_interval: Duration,
}

impl PgConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            connect_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Builds a lazily connecting pool. Nothing is dialled until the first query,
/// so an unreachable server shows up in the readiness probes instead of here.
pub fn connect(config: &PgConfig) -> Result<PgPool, WeaverError> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.connect_timeout)
        .connect_lazy(&config.database_url)
        .map_err(|e| WeaverError::validation(format!("invalid database url: {e}")))
}

fn is_connectivity(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_)
    )
}

/// Errors of broker operations.
pub(crate) fn broker_error(operation: &str, err: sqlx::Error) -> WeaverError {
    if is_connectivity(&err) {
        WeaverError::BrokerUnavailable(format!("{operation}: {err}"))
    } else {
        WeaverError::Datastore(format!("{operation}: {err}"))
    }
}

/// Errors of datastore operations.
pub(crate) fn datastore_error(operation: &str, err: sqlx::Error) -> WeaverError {
    WeaverError::Datastore(format!("{operation}: {err}"))
}

/// Milliseconds for `($n * INTERVAL '1 millisecond')` binds.
pub(crate) fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn pool_timeouts_mean_broker_unavailable() {
        assert_matches!(
            broker_error("lease", sqlx::Error::PoolTimedOut),
            WeaverError::BrokerUnavailable(msg) if msg.starts_with("lease:")
        );
        assert_matches!(
            broker_error("ack", sqlx::Error::RowNotFound),
            WeaverError::Datastore(_)
        );
        assert_matches!(
            datastore_error("record_result", sqlx::Error::PoolTimedOut),
            WeaverError::Datastore(_)
        );
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_secs(2)), 2_000);
        assert_eq!(millis(Duration::MAX), i64::MAX);
    }

    #[test]
    fn bad_urls_are_rejected_without_dialling() {
        assert!(connect(&PgConfig::new("not a url")).is_err());
    }

    #[test]
    fn migrations_are_embedded() {
        assert!(MIGRATOR.iter().count() >= 1);
    }
}
