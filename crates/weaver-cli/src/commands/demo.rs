//! demo - 全ロールを 1 プロセスで in-memory 実装に対して動かす
//!
//! migrator の代わりに少し遅れて datastore を ready にし、
//! scheduler がそれを待ってから tick を始める様子を見せる。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use serde_json::json;
use tokio::sync::watch;
use tracing::info;
use weaver_core::app::{
    PeriodicScheduler, Producer, QueueCounts, ReadinessPolicy, Role, SchedulerConfig,
    SchedulerDeps, StartupPlan, WorkerConfig, WorkerDeps, WorkerPool, WorkerStatsSnapshot,
};
use weaver_core::domain::{EnqueueOptions, HealthState, NewJob, QueueName, Recurrence, ScheduleDefinition};
use weaver_core::impls::InMemoryDatastore;
use weaver_core::ports::{Broker, SystemClock, TracingEventSink};
use weaver_core::queue::{BrokerConfig, InMemoryBroker, RetryPolicy};

use super::{shutdown_signal, wait_for_shutdown};
use crate::handlers::{ECHO, FAIL, Sleep, builtin_app};

#[derive(Args)]
pub struct DemoCommand {
    /// Stop after this many seconds (0 = until ctrl-c)
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    #[arg(long, default_value_t = 2)]
    concurrency: usize,
}

#[derive(Debug)]
pub struct DemoReport {
    pub stats: WorkerStatsSnapshot,
    pub counts: QueueCounts,
    pub dead_letters: usize,
}

/// Runs every role against one in-memory broker and datastore until
/// `shutdown` flips.
pub async fn run_demo(
    concurrency: usize,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<DemoReport> {
    let queue = QueueName::new("default");
    let broker = Arc::new(InMemoryBroker::new(
        BrokerConfig::default().with_visibility_timeout(Duration::from_secs(5)),
    ));
    let datastore = Arc::new(InMemoryDatastore::starting());
    let policy = ReadinessPolicy::default().with_interval(Duration::from_millis(100));

    // migrator の代役
    let migrating = Arc::clone(&datastore);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        migrating.set_readiness(HealthState::Ready);
        info!("datastore migrated");
    });

    let app = builtin_app(None).context("invalid handler table")?;
    StartupPlan::for_role(Role::Worker, policy, broker.clone(), datastore.clone())
        .wait()
        .await?;
    let pool = WorkerPool::spawn(
        WorkerConfig::default()
            .with_queues([queue.clone()])
            .with_concurrency(concurrency)
            .with_lease_wait(Duration::from_millis(200)),
        WorkerDeps {
            broker: broker.clone(),
            results: datastore.clone(),
            runtime: Arc::new(app.runtime()),
            events: Arc::new(TracingEventSink),
            clock: Arc::new(SystemClock),
        },
    )?;

    let mut scheduler = PeriodicScheduler::new(
        SchedulerConfig::default().with_tick_interval(Duration::from_millis(250)),
        SchedulerDeps {
            broker: broker.clone(),
            store: datastore.clone(),
            lock: Arc::new(datastore.scheduler_lock()),
            clock: Arc::new(SystemClock),
            events: Arc::new(TracingEventSink),
        },
    )
    .with_definitions(vec![ScheduleDefinition {
        name: "heartbeat".into(),
        recurrence: Recurrence::every(Duration::from_secs(2)),
        queue: queue.clone(),
        handler: ECHO.into(),
        payload: json!({"beat": true}),
        max_retries: None,
        enabled: true,
    }])?;
    let plan = StartupPlan::for_role(Role::Scheduler, policy, broker.clone(), datastore.clone());
    let scheduler_shutdown = shutdown.clone();
    let scheduler_task =
        tokio::spawn(async move { scheduler.run_when_ready(&plan, scheduler_shutdown).await });

    let producer = Producer::new(broker.clone()).with_events(Arc::new(TracingEventSink));
    for n in 0..3 {
        producer
            .enqueue(NewJob::new(queue.clone(), ECHO, json!({"n": n})))
            .await?;
    }
    producer
        .enqueue_task(queue.clone(), &Sleep { ms: 300 }, EnqueueOptions::default())
        .await?;
    producer
        .enqueue(
            NewJob::new(queue.clone(), FAIL, json!({})).with_options(
                EnqueueOptions::default()
                    .with_max_retries(2)
                    .with_retry(RetryPolicy::immediate()),
            ),
        )
        .await?;

    wait_for_shutdown(shutdown).await;
    let stats = pool.shutdown(Duration::from_secs(5)).await;
    scheduler_task
        .await
        .context("scheduler task panicked")?
        .context("scheduler stopped with an error")?;

    Ok(DemoReport {
        stats,
        counts: broker.counts(&queue).await?,
        dead_letters: broker.dead_letters(&queue, usize::MAX).await?.len(),
    })
}

impl DemoCommand {
    pub async fn execute(self) -> anyhow::Result<()> {
        let (tx, rx) = watch::channel(false);
        let interrupted = shutdown_signal();
        let seconds = self.seconds;
        tokio::spawn(async move {
            if seconds == 0 {
                wait_for_shutdown(interrupted).await;
            } else {
                tokio::select! {
                    _ = wait_for_shutdown(interrupted) => {}
                    _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                }
            }
            let _ = tx.send(true);
        });

        let report = run_demo(self.concurrency, rx).await?;
        info!(
            succeeded = report.stats.succeeded,
            retried = report.stats.retried,
            dead_lettered = report.stats.dead_lettered,
            ready = report.counts.ready,
            dead_letters = report.dead_letters,
            "demo finished"
        );
        Ok(())
    }
}
