use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono_tz::Tz;
use clap::Args;
use tracing::info;
use weaver_core::app::{PeriodicScheduler, Role, SchedulerConfig, SchedulerDeps};
use weaver_core::domain::ScheduleDefinition;
use weaver_core::ports::{SystemClock, TracingEventSink};
use weaver_pg::PgSchedulerLock;

use super::{DatabaseArgs, parse_timezone, shutdown_signal};

#[derive(Args)]
pub struct SchedulerCommand {
    #[command(flatten)]
    db: DatabaseArgs,

    /// JSON array of schedule definitions, upserted once this instance holds the lock
    #[arg(long, env = "WEAVER_SCHEDULES")]
    schedules: Option<PathBuf>,

    /// Milliseconds between ticks
    #[arg(long, env = "WEAVER_TICK_MS", default_value_t = 1_000)]
    tick_ms: u64,

    /// Seconds between lock attempts while another scheduler is active
    #[arg(long, env = "WEAVER_LOCK_RETRY_SECS", default_value_t = 5)]
    lock_retry_secs: u64,

    /// Seconds between re-reads of the schedule table while active
    #[arg(long, env = "WEAVER_RELOAD_SECS", default_value_t = 60)]
    reload_secs: u64,

    /// IANA zone cron expressions are read in
    #[arg(long, env = "WEAVER_TIMEZONE", default_value = "UTC", value_parser = parse_timezone)]
    timezone: Tz,
}

/// Reads a seed file. Definitions are validated when the scheduler is built.
pub fn read_definitions(path: &Path) -> anyhow::Result<Vec<ScheduleDefinition>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("malformed schedule file {}", path.display()))
}

impl SchedulerCommand {
    pub async fn execute(self) -> anyhow::Result<()> {
        let definitions = match &self.schedules {
            Some(path) => read_definitions(path)?,
            None => Vec::new(),
        };

        let backends = self.db.connect()?;
        self.db
            .plan(Role::Scheduler, &backends)
            .wait()
            .await
            .context("scheduler dependencies not ready")?;

        let config = SchedulerConfig::default()
            .with_tick_interval(Duration::from_millis(self.tick_ms))
            .with_lock_retry(Duration::from_secs(self.lock_retry_secs))
            .with_reload_interval(Duration::from_secs(self.reload_secs))
            .with_timezone(self.timezone);
        info!(timezone = %self.timezone, definitions = definitions.len(), "starting scheduler");
        let lock = PgSchedulerLock::new(backends.datastore.pool().clone());
        let deps = SchedulerDeps {
            broker: backends.broker,
            store: backends.datastore,
            lock: Arc::new(lock),
            clock: Arc::new(SystemClock),
            events: Arc::new(TracingEventSink),
        };
        let mut scheduler = PeriodicScheduler::new(config, deps)
            .with_definitions(definitions)
            .context("invalid schedule definitions")?;

        scheduler
            .run(shutdown_signal())
            .await
            .context("scheduler stopped with an error")?;
        Ok(())
    }
}
