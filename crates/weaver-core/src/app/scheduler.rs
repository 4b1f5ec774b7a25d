//! PeriodicScheduler - 定期ジョブの tick loop
//!
//! # 状態遷移（entry ごと）
//! Idle → Due → Fired → Idle
//!
//! - enqueue に成功したときだけ last_fired_at を進める（失敗したら次の tick で再試行）
//! - last_fired_at の保存に失敗しても、このプロセス内では二重発火しない
//!   （クラッシュ再起動時の重複は 1 回分に収まる）
//! - SchedulerLock を持っているプロセスだけが tick する。tick の前に毎回まだ持っているか確かめ、
//!   失っていたら standby に戻る
//! - 静的定義の書き込みも lock を取ってから行う（standby は何も書かない）

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::startup::StartupPlan;
use super::worker_loop::stopped;
use crate::domain::time::elapsed;
use crate::domain::{DomainEvent, EntryState, JobId, ScheduleDefinition, ScheduleEntry};
use crate::error::WeaverError;
use crate::ports::{Broker, Clock, EventSink, ScheduleStore, SchedulerLock};

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,

    /// Standby poll interval while another instance holds the lock.
    pub lock_retry: Duration,

    /// How often the active instance re-reads the schedule table.
    pub reload_interval: Duration,

    /// Zone whose wall clock cron fields are read in.
    pub timezone: Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            lock_retry: Duration::from_secs(5),
            reload_interval: Duration::from_secs(60),
            timezone: Tz::UTC,
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_lock_retry(mut self, lock_retry: Duration) -> Self {
        self.lock_retry = lock_retry;
        self
    }

    pub fn with_reload_interval(mut self, reload_interval: Duration) -> Self {
        self.reload_interval = reload_interval;
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }
}

#[derive(Clone)]
pub struct SchedulerDeps {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn ScheduleStore>,
    pub lock: Arc<dyn SchedulerLock>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventSink>,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub fired: Vec<(String, JobId)>,
    pub failed: Vec<(String, String)>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.fired.is_empty() && self.failed.is_empty()
    }
}

/// How a stint as the active scheduler ended.
enum Stint {
    Shutdown,
    LockLost,
}

pub struct PeriodicScheduler {
    config: SchedulerConfig,
    deps: SchedulerDeps,
    definitions: Vec<ScheduleDefinition>,
    entries: Vec<ScheduleEntry>,
}

impl PeriodicScheduler {
    pub fn new(config: SchedulerConfig, deps: SchedulerDeps) -> Self {
        Self {
            config,
            deps,
            definitions: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Static definitions written to the schedule table each time `run` takes
    /// the lock. Validated here, nothing is written yet.
    pub fn with_definitions(
        mut self,
        definitions: Vec<ScheduleDefinition>,
    ) -> Result<Self, WeaverError> {
        let now = self.deps.clock.now();
        for definition in &definitions {
            definition.clone().into_entry(now).validate()?;
        }
        self.definitions = definitions;
        Ok(self)
    }

    /// Upserts static definitions into the schedule table and reloads it.
    /// Existing `last_fired_at` values survive. Call only while holding the lock.
    pub async fn sync_entries(
        &mut self,
        definitions: Vec<ScheduleDefinition>,
    ) -> Result<usize, WeaverError> {
        let now = self.deps.clock.now();
        let entries: Vec<ScheduleEntry> = definitions
            .into_iter()
            .map(|d| d.into_entry(now))
            .collect();
        for entry in &entries {
            entry.validate()?;
        }
        for entry in &entries {
            self.deps.store.upsert_schedule(entry).await?;
        }
        self.load().await?;
        Ok(entries.len())
    }

    /// Replaces the in-memory table with the stored one. A `last_fired_at`
    /// seen by this process never moves backwards.
    pub async fn load(&mut self) -> Result<(), WeaverError> {
        let mut stored = self.deps.store.load_schedules().await?;
        let seen: HashMap<&str, DateTime<Utc>> = self
            .entries
            .iter()
            .filter_map(|e| e.last_fired_at.map(|at| (e.name.as_str(), at)))
            .collect();
        for entry in &mut stored {
            if let Some(&at) = seen.get(entry.name.as_str()) {
                entry.last_fired_at = entry.last_fired_at.max(Some(at));
            }
        }
        self.entries = stored;
        debug!(entries = self.entries.len(), "schedule table loaded");
        Ok(())
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// `Fired` while `now` is the instant of the last fire.
    pub fn entry_state(entry: &ScheduleEntry, now: DateTime<Utc>, tz: Tz) -> EntryState {
        if entry.last_fired_at.is_some_and(|at| at >= now) {
            EntryState::Fired
        } else if entry.is_due_in(now, tz) {
            EntryState::Due
        } else {
            EntryState::Idle
        }
    }

    /// Fires every entry that is due at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let tz = self.config.timezone;
        let mut report = TickReport::default();
        for entry in self.entries.iter_mut() {
            if Self::entry_state(entry, now, tz) != EntryState::Due {
                continue;
            }

            match self.deps.broker.enqueue(entry.to_new_job()).await {
                Ok(job_id) => {
                    if let Some(due_at) = entry.next_fire_at_in(tz) {
                        debug!(
                            schedule = %entry.name,
                            lag_ms = elapsed(due_at, now).as_millis() as u64,
                            "schedule fired"
                        );
                    }
                    // Due → Fired
                    entry.last_fired_at = Some(now);
                    if let Err(e) = self.deps.store.mark_fired(&entry.name, now).await {
                        warn!(schedule = %entry.name, error = %e, "could not persist last fired time");
                    }
                    self.deps.events.emit(DomainEvent::ScheduleFired {
                        schedule: entry.name.clone(),
                        job_id,
                        fired_at: now,
                    });
                    report.fired.push((entry.name.clone(), job_id));
                }
                Err(e) => {
                    // stays Idle with the old anchor, so the next tick retries
                    self.deps.events.emit(DomainEvent::ScheduleFailed {
                        schedule: entry.name.clone(),
                        error: e.to_string(),
                    });
                    report.failed.push((entry.name.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// Ticks while holding the scheduler lock until `shutdown` flips to `true`.
    /// A lost lock sends the instance back to standby.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), WeaverError> {
        loop {
            if !self.acquire_lock(&mut shutdown).await {
                return Ok(());
            }

            let stint = self.run_locked(&mut shutdown).await;
            if let Err(e) = self.deps.lock.release().await {
                warn!(error = %e, "scheduler lock release failed");
            }
            match stint {
                Ok(Stint::LockLost) => {
                    warn!("scheduler lock lost, back to standby");
                    // 新しい持ち主に先を譲る
                    tokio::select! {
                        _ = stopped(&mut shutdown) => return Ok(()),
                        _ = tokio::time::sleep(self.config.lock_retry) => {}
                    }
                }
                Ok(Stint::Shutdown) => {
                    info!("scheduler stopped");
                    return Ok(());
                }
                Err(e) => {
                    info!("scheduler stopped");
                    return Err(e);
                }
            }
        }
    }

    /// Waits for the startup gates, then runs.
    pub async fn run_when_ready(
        &mut self,
        plan: &StartupPlan,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), WeaverError> {
        plan.wait().await?;
        self.run(shutdown).await
    }

    async fn acquire_lock(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut announced = false;
        loop {
            match self.deps.lock.try_acquire().await {
                Ok(true) => {
                    info!("scheduler lock acquired");
                    return true;
                }
                Ok(false) if !announced => {
                    info!("another scheduler holds the lock, standing by");
                    announced = true;
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "scheduler lock attempt failed"),
            }
            tokio::select! {
                _ = stopped(shutdown) => return false,
                _ = tokio::time::sleep(self.config.lock_retry) => {}
            }
        }
    }

    async fn still_leader(&self) -> bool {
        match self.deps.lock.is_held().await {
            Ok(held) => held,
            Err(e) => {
                warn!(error = %e, "scheduler lock check failed");
                false
            }
        }
    }

    async fn run_locked(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Stint, WeaverError> {
        if self.definitions.is_empty() {
            self.load().await?;
        } else {
            let synced = self.sync_entries(self.definitions.clone()).await?;
            info!(definitions = synced, "schedule definitions synced");
        }

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        // 1 tick が長引いても並行させない。遅れた分は飛ばす
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut loaded_at = Instant::now();
        loop {
            tokio::select! {
                _ = stopped(shutdown) => return Ok(Stint::Shutdown),
                _ = ticker.tick() => {}
            }
            if !self.still_leader().await {
                return Ok(Stint::LockLost);
            }

            if loaded_at.elapsed() >= self.config.reload_interval {
                if let Err(e) = self.load().await {
                    warn!(error = %e, "schedule reload failed, keeping current table");
                }
                loaded_at = Instant::now();
            }

            let report = self.tick(self.deps.clock.now()).await;
            if !report.is_empty() {
                debug!(fired = report.fired.len(), failed = report.failed.len(), "tick");
            }
        }
    }
}
