mod dead_letters;
mod demo;
mod enqueue;
mod migrate;
mod scheduler;
mod schedules;
mod worker;

pub use dead_letters::DeadLettersCommand;
pub use demo::DemoCommand;
pub use enqueue::EnqueueCommand;
pub use migrate::MigrateCommand;
pub use scheduler::SchedulerCommand;
pub use schedules::SchedulesCommand;
pub use worker::WorkerCommand;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono_tz::Tz;
use clap::Args;
use tokio::sync::watch;
use tracing::{info, warn};
use weaver_core::app::{ReadinessPolicy, Role, StartupPlan};
use weaver_core::queue::BrokerConfig;
use weaver_pg::{PgBroker, PgConfig, PgDatastore};

/// Connection settings shared by every PostgreSQL-backed command.
#[derive(Args, Debug, Clone)]
pub struct DatabaseArgs {
    /// PostgreSQL URL used as both broker and datastore
    #[arg(long, env = "WEAVER_DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "WEAVER_DB_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: u32,

    /// Pool acquire timeout in seconds
    #[arg(long, env = "WEAVER_DB_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub connect_timeout_secs: u64,

    /// Seconds between readiness probes at startup
    #[arg(long, env = "WEAVER_READINESS_INTERVAL_SECS", default_value_t = 1)]
    pub readiness_interval_secs: u64,

    /// Give up waiting for dependencies after this many seconds
    #[arg(long, env = "WEAVER_READINESS_TIMEOUT_SECS", default_value_t = 60)]
    pub readiness_timeout_secs: u64,

    /// Lease visibility timeout in seconds
    #[arg(long, env = "WEAVER_VISIBILITY_TIMEOUT_SECS", default_value_t = 30)]
    pub visibility_timeout_secs: u64,
}

impl DatabaseArgs {
    pub fn pg_config(&self) -> PgConfig {
        PgConfig::new(&self.database_url)
            .with_max_connections(self.max_connections)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs))
    }

    pub fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy::default()
            .with_interval(Duration::from_secs(self.readiness_interval_secs))
            .with_timeout(Duration::from_secs(self.readiness_timeout_secs))
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::default()
            .with_visibility_timeout(Duration::from_secs(self.visibility_timeout_secs))
    }

    /// Broker and datastore over one lazily connecting pool.
    pub fn connect(&self) -> anyhow::Result<Backends> {
        let pg = self.pg_config();
        let pool = weaver_pg::connect(&pg).context("failed to build connection pool")?;
        Ok(Backends {
            broker: Arc::new(PgBroker::new(pool.clone(), &pg, self.broker_config())),
            datastore: Arc::new(PgDatastore::new(pool)),
        })
    }

    /// Startup gates of `role` over `backends`.
    pub fn plan(&self, role: Role, backends: &Backends) -> StartupPlan {
        StartupPlan::for_role(
            role,
            self.readiness(),
            backends.broker.clone(),
            backends.datastore.clone(),
        )
    }
}

pub struct Backends {
    pub broker: Arc<PgBroker>,
    pub datastore: Arc<PgDatastore>,
}

/// `--timezone` values are IANA names such as `Asia/Tehran`.
pub fn parse_timezone(name: &str) -> Result<Tz, String> {
    name.parse::<Tz>().map_err(|e| e.to_string())
}

/// Flips to `true` on ctrl-c.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => warn!(error = %e, "cannot listen for ctrl-c, shutting down"),
        }
        let _ = tx.send(true);
    });
    rx
}

/// Resolves once `rx` reads `true` (or its sender is gone).
pub async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
