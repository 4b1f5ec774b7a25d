use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use tracing::info;
use weaver_core::app::{Role, WorkerConfig, WorkerDeps, WorkerPool};
use weaver_core::ports::{SystemClock, TracingEventSink};

use super::{DatabaseArgs, shutdown_signal, wait_for_shutdown};
use crate::handlers::builtin_app;

#[derive(Args)]
pub struct WorkerCommand {
    #[command(flatten)]
    db: DatabaseArgs,

    /// Queues to consume (repeatable)
    #[arg(long = "queue", env = "WEAVER_QUEUES", value_delimiter = ',', default_value = "default")]
    queues: Vec<String>,

    /// Concurrent slots per queue
    #[arg(long, env = "WEAVER_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Seconds in-flight jobs get to finish after ctrl-c
    #[arg(long, env = "WEAVER_GRACE_SECS", default_value_t = 30)]
    grace_secs: u64,

    /// Deadline in seconds for jobs without their own timeout
    #[arg(long, env = "WEAVER_JOB_TIMEOUT_SECS")]
    job_timeout_secs: Option<u64>,
}

impl WorkerCommand {
    pub async fn execute(self) -> anyhow::Result<()> {
        let app = builtin_app(self.job_timeout_secs.map(Duration::from_secs))
            .context("invalid handler table")?;
        let backends = self.db.connect()?;
        self.db
            .plan(Role::Worker, &backends)
            .wait()
            .await
            .context("worker dependencies not ready")?;

        let config = WorkerConfig::default()
            .with_queues(self.queues)
            .with_concurrency(self.concurrency);
        let deps = WorkerDeps {
            broker: backends.broker,
            results: backends.datastore,
            runtime: Arc::new(app.runtime()),
            events: Arc::new(TracingEventSink),
            clock: Arc::new(SystemClock),
        };
        let pool = WorkerPool::spawn(config, deps).context("invalid worker configuration")?;

        wait_for_shutdown(shutdown_signal()).await;
        let stats = pool.shutdown(Duration::from_secs(self.grace_secs)).await;
        info!(
            succeeded = stats.succeeded,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            cancelled = stats.cancelled,
            "worker stopped"
        );
        Ok(())
    }
}
