//! InMemoryDatastore - 開発用の datastore
//!
//! health は外から切り替えられる（起動順序のテストやデモで使う）。
//! scheduler lock は `scheduler_lock()` で取り出した holder ごとに持ち主を区別する。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{ExecutionResult, HealthState, JobId, ScheduleEntry};
use crate::error::WeaverError;
use crate::ports::{HealthProbe, ResultStore, ScheduleStore, SchedulerLock};

#[derive(Debug, Default)]
struct LockTable {
    holder: Option<u64>,
    next_holder: u64,
}

pub struct InMemoryDatastore {
    results: Mutex<HashMap<(JobId, u32), ExecutionResult>>,
    schedules: Mutex<BTreeMap<String, ScheduleEntry>>,
    liveness: RwLock<HealthState>,
    readiness: RwLock<HealthState>,
    lock: Arc<StdMutex<LockTable>>,
    available: AtomicBool,
}

impl InMemoryDatastore {
    /// Live and ready.
    pub fn new() -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            schedules: Mutex::new(BTreeMap::new()),
            liveness: RwLock::new(HealthState::Ready),
            readiness: RwLock::new(HealthState::Ready),
            lock: Arc::new(StdMutex::new(LockTable::default())),
            available: AtomicBool::new(true),
        }
    }

    /// Live but still "migrating".
    pub fn starting() -> Self {
        let store = Self::new();
        store.set_readiness(HealthState::not_ready("migrations pending"));
        store
    }

    pub fn set_readiness(&self, state: HealthState) {
        *self.readiness.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn set_liveness(&self, state: HealthState) {
        *self.liveness.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// While unavailable, result and schedule writes fail with `Datastore`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), WeaverError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WeaverError::Datastore("in-memory datastore is offline".to_string()))
        }
    }

    pub async fn results(&self) -> Vec<ExecutionResult> {
        let mut results: Vec<_> = self.results.lock().await.values().cloned().collect();
        results.sort_by_key(|r| (r.completed_at, r.generation));
        results
    }

    /// A new contender for the scheduler lock. Every holder is a separate owner,
    /// like one database session each.
    pub fn scheduler_lock(&self) -> InMemorySchedulerLock {
        let mut table = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        table.next_holder += 1;
        InMemorySchedulerLock {
            table: Arc::clone(&self.lock),
            id: table.next_holder,
        }
    }

    /// Drops whoever holds the scheduler lock, as a lost session would.
    pub fn break_scheduler_lock(&self) {
        self.lock.lock().unwrap_or_else(|e| e.into_inner()).holder = None;
    }
}

impl Default for InMemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for InMemoryDatastore {
    async fn record_result(&self, result: &ExecutionResult) -> Result<bool, WeaverError> {
        self.ensure_available()?;
        let mut results = self.results.lock().await;
        let key = (result.job_id, result.generation);
        if results.contains_key(&key) {
            return Ok(false);
        }
        results.insert(key, result.clone());
        Ok(true)
    }

    async fn result_for(&self, job_id: JobId) -> Result<Option<ExecutionResult>, WeaverError> {
        Ok(self
            .results
            .lock()
            .await
            .values()
            .filter(|r| r.job_id == job_id)
            .max_by_key(|r| r.generation)
            .cloned())
    }
}

#[async_trait]
impl ScheduleStore for InMemoryDatastore {
    async fn load_schedules(&self) -> Result<Vec<ScheduleEntry>, WeaverError> {
        Ok(self.schedules.lock().await.values().cloned().collect())
    }

    async fn upsert_schedule(&self, entry: &ScheduleEntry) -> Result<(), WeaverError> {
        let mut schedules = self.schedules.lock().await;
        let mut entry = entry.clone();
        if let Some(existing) = schedules.get(&entry.name) {
            entry.last_fired_at = existing.last_fired_at;
            entry.created_at = existing.created_at;
        }
        schedules.insert(entry.name.clone(), entry);
        Ok(())
    }

    async fn mark_fired(&self, name: &str, at: DateTime<Utc>) -> Result<(), WeaverError> {
        self.ensure_available()?;
        let mut schedules = self.schedules.lock().await;
        let entry = schedules
            .get_mut(name)
            .ok_or_else(|| WeaverError::Datastore(format!("unknown schedule `{name}`")))?;
        entry.last_fired_at = Some(at);
        Ok(())
    }
}

/// One owner of the in-memory scheduler lock.
pub struct InMemorySchedulerLock {
    table: Arc<StdMutex<LockTable>>,
    id: u64,
}

impl InMemorySchedulerLock {
    fn with_table<T>(&self, f: impl FnOnce(&mut LockTable) -> T) -> T {
        f(&mut self.table.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

#[async_trait]
impl SchedulerLock for InMemorySchedulerLock {
    async fn try_acquire(&self) -> Result<bool, WeaverError> {
        Ok(self.with_table(|table| match table.holder {
            None => {
                table.holder = Some(self.id);
                true
            }
            Some(holder) => holder == self.id,
        }))
    }

    async fn is_held(&self) -> Result<bool, WeaverError> {
        Ok(self.with_table(|table| table.holder == Some(self.id)))
    }

    async fn release(&self) -> Result<(), WeaverError> {
        self.with_table(|table| {
            if table.holder == Some(self.id) {
                table.holder = None;
            }
        });
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for InMemoryDatastore {
    async fn liveness(&self) -> HealthState {
        self.liveness.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn readiness(&self) -> HealthState {
        let live = self.liveness().await;
        if !live.is_ready() {
            return live;
        }
        self.readiness.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobDefaults, NewJob, Recurrence};
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;

    fn result(job_id: JobId, error: Option<&str>) -> ExecutionResult {
        let env = NewJob::new("q", "h", json!({})).into_envelope(
            job_id,
            Utc::now(),
            &JobDefaults::default(),
        );
        match error {
            Some(e) => ExecutionResult::failure(&env, e, Utc::now()),
            None => ExecutionResult::success(&env, Utc::now()),
        }
    }

    #[tokio::test]
    async fn results_are_insert_if_absent() {
        let store = InMemoryDatastore::new();
        let id = JobId::generate();

        assert!(store.record_result(&result(id, None)).await.unwrap());
        assert!(!store.record_result(&result(id, Some("late duplicate"))).await.unwrap());

        let stored = store.result_for(id).await.unwrap().unwrap();
        assert_eq!(stored.error, None);
        assert_eq!(store.results().await.len(), 1);
    }

    #[tokio::test]
    async fn upsert_keeps_last_fired() {
        let store = InMemoryDatastore::new();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let entry = ScheduleEntry::new(
            "beat",
            Recurrence::every(Duration::from_secs(60)),
            "q",
            "h",
            json!({}),
            t0,
        );
        store.upsert_schedule(&entry).await.unwrap();
        store.mark_fired("beat", t0).await.unwrap();

        let mut changed = entry.clone();
        changed.recurrence = Recurrence::every(Duration::from_secs(120));
        changed.created_at = Utc::now();
        store.upsert_schedule(&changed).await.unwrap();

        let loaded = store.load_schedules().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].last_fired_at, Some(t0));
        assert_eq!(loaded[0].created_at, t0);
        assert_eq!(loaded[0].recurrence.as_str(), "every 120s");
    }

    #[tokio::test]
    async fn replayed_generation_gets_its_own_result() {
        let store = InMemoryDatastore::new();
        let id = JobId::generate();
        assert!(store.record_result(&result(id, Some("gave up"))).await.unwrap());

        let mut replayed = result(id, None);
        replayed.generation = 1;
        assert!(store.record_result(&replayed).await.unwrap());
        assert!(!store.record_result(&replayed).await.unwrap());

        let latest = store.result_for(id).await.unwrap().unwrap();
        assert_eq!((latest.generation, latest.error), (1, None));
        assert_eq!(store.results().await.len(), 2);
    }

    #[tokio::test]
    async fn lock_is_exclusive_per_holder() {
        let store = InMemoryDatastore::new();
        let (a, b) = (store.scheduler_lock(), store.scheduler_lock());

        assert!(a.try_acquire().await.unwrap());
        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());
        assert!(a.is_held().await.unwrap());
        assert!(!b.is_held().await.unwrap());

        // b が release しても a の lock は外れない
        b.release().await.unwrap();
        assert!(a.is_held().await.unwrap());

        a.release().await.unwrap();
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn broken_lock_is_noticed_by_its_holder() {
        let store = InMemoryDatastore::new();
        let (a, b) = (store.scheduler_lock(), store.scheduler_lock());
        assert!(a.try_acquire().await.unwrap());

        store.break_scheduler_lock();
        assert!(!a.is_held().await.unwrap());
        assert!(b.try_acquire().await.unwrap());
        assert!(!a.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn readiness_requires_liveness() {
        let store = InMemoryDatastore::starting();
        assert!(store.liveness().await.is_ready());
        assert!(!store.readiness().await.is_ready());

        store.set_readiness(HealthState::Ready);
        store.set_liveness(HealthState::not_ready("connection refused"));
        assert_eq!(
            store.readiness().await,
            HealthState::not_ready("connection refused")
        );
    }
}
