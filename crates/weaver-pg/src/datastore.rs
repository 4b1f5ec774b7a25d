//! PgDatastore - results, schedule table and health probes

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, instrument};
use weaver_core::WeaverError;
use weaver_core::domain::{
    ExecutionResult, HandlerId, HealthState, JobId, QueueName, Recurrence, ResultOutcome,
    ScheduleEntry,
};
use weaver_core::ports::{HealthProbe, ResultStore, ScheduleStore};

use crate::{MIGRATOR, datastore_error};

#[derive(Debug, sqlx::FromRow)]
struct ResultRow {
    job_id: String,
    generation: i32,
    queue: String,
    handler: String,
    outcome: String,
    error: Option<String>,
    delivery_count: i32,
    completed_at: DateTime<Utc>,
}

impl ResultRow {
    fn into_result(self) -> Result<ExecutionResult, WeaverError> {
        let job_id = self
            .job_id
            .parse::<JobId>()
            .map_err(|e| WeaverError::Datastore(format!("bad job id `{}`: {e}", self.job_id)))?;
        let outcome = self
            .outcome
            .parse::<ResultOutcome>()
            .map_err(WeaverError::Datastore)?;
        Ok(ExecutionResult {
            job_id,
            generation: u32::try_from(self.generation).unwrap_or(0),
            queue: QueueName::new(self.queue),
            handler: HandlerId::new(self.handler),
            outcome,
            error: self.error,
            delivery_count: u32::try_from(self.delivery_count).unwrap_or(0),
            completed_at: self.completed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ScheduleRow {
    name: String,
    recurrence: String,
    queue: String,
    handler: String,
    payload: serde_json::Value,
    max_retries: Option<i32>,
    enabled: bool,
    last_fired_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl ScheduleRow {
    fn into_entry(self) -> Result<ScheduleEntry, WeaverError> {
        let recurrence = Recurrence::parse(&self.recurrence).map_err(|e| {
            WeaverError::Datastore(format!("schedule `{}` has a bad recurrence: {e}", self.name))
        })?;
        Ok(ScheduleEntry {
            name: self.name,
            recurrence,
            queue: QueueName::new(self.queue),
            handler: HandlerId::new(self.handler),
            payload: self.payload,
            max_retries: self.max_retries.and_then(|n| u32::try_from(n).ok()),
            enabled: self.enabled,
            last_fired_at: self.last_fired_at,
            created_at: self.created_at,
        })
    }
}

/// Result backend, schedule table and health endpoint on PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies pending embedded migrations.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), WeaverError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| WeaverError::Datastore(format!("migrate: {e}")))?;
        info!(migrations = MIGRATOR.iter().count(), "schema up to date");
        Ok(())
    }

    /// Versions of embedded migrations not yet applied successfully.
    pub async fn pending_migrations(&self) -> Result<Vec<i64>, WeaverError> {
        let applied: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM _sqlx_migrations WHERE success")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| datastore_error("pending_migrations", e))?;
        let applied: HashSet<i64> = applied.into_iter().collect();

        Ok(MIGRATOR
            .iter()
            .filter(|m| m.migration_type.is_up_migration() && !applied.contains(&m.version))
            .map(|m| m.version)
            .collect())
    }
}

#[async_trait]
impl ResultStore for PgDatastore {
    #[instrument(skip(self, result), fields(job_id = %result.job_id, outcome = %result.outcome), err)]
    async fn record_result(&self, result: &ExecutionResult) -> Result<bool, WeaverError> {
        let rows = sqlx::query(
            "INSERT INTO weaver_results \
                 (job_id, generation, queue, handler, outcome, error, delivery_count, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (job_id, generation) DO NOTHING",
        )
        .bind(result.job_id.to_ulid_string())
        .bind(i32::try_from(result.generation).unwrap_or(i32::MAX))
        .bind(result.queue.as_str())
        .bind(result.handler.as_str())
        .bind(result.outcome.as_str())
        .bind(result.error.as_deref())
        .bind(i32::try_from(result.delivery_count).unwrap_or(i32::MAX))
        .bind(result.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| datastore_error("record_result", e))?
        .rows_affected();
        Ok(rows == 1)
    }

    async fn result_for(&self, job_id: JobId) -> Result<Option<ExecutionResult>, WeaverError> {
        let row = sqlx::query_as::<_, ResultRow>(
            "SELECT job_id, generation, queue, handler, outcome, error, delivery_count, completed_at \
             FROM weaver_results WHERE job_id = $1 \
             ORDER BY generation DESC \
             LIMIT 1",
        )
        .bind(job_id.to_ulid_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| datastore_error("result_for", e))?;
        row.map(ResultRow::into_result).transpose()
    }
}

#[async_trait]
impl ScheduleStore for PgDatastore {
    async fn load_schedules(&self) -> Result<Vec<ScheduleEntry>, WeaverError> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            "SELECT name, recurrence, queue, handler, payload, max_retries, enabled, \
                    last_fired_at, created_at \
             FROM weaver_schedules ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| datastore_error("load_schedules", e))?;
        rows.into_iter().map(ScheduleRow::into_entry).collect()
    }

    #[instrument(skip(self, entry), fields(schedule = %entry.name), err)]
    async fn upsert_schedule(&self, entry: &ScheduleEntry) -> Result<(), WeaverError> {
        sqlx::query(
            "INSERT INTO weaver_schedules \
                 (name, recurrence, queue, handler, payload, max_retries, enabled, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (name) DO UPDATE SET \
                 recurrence = EXCLUDED.recurrence, \
                 queue = EXCLUDED.queue, \
                 handler = EXCLUDED.handler, \
                 payload = EXCLUDED.payload, \
                 max_retries = EXCLUDED.max_retries, \
                 enabled = EXCLUDED.enabled",
        )
        .bind(&entry.name)
        .bind(entry.recurrence.as_str())
        .bind(entry.queue.as_str())
        .bind(entry.handler.as_str())
        .bind(&entry.payload)
        .bind(entry.max_retries.map(|n| i32::try_from(n).unwrap_or(i32::MAX)))
        .bind(entry.enabled)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| datastore_error("upsert_schedule", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn mark_fired(&self, name: &str, at: DateTime<Utc>) -> Result<(), WeaverError> {
        let rows = sqlx::query("UPDATE weaver_schedules SET last_fired_at = $2 WHERE name = $1")
            .bind(name)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| datastore_error("mark_fired", e))?
            .rows_affected();
        if rows == 0 {
            return Err(WeaverError::Datastore(format!("unknown schedule `{name}`")));
        }
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for PgDatastore {
    async fn liveness(&self) -> HealthState {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => HealthState::Ready,
            Err(e) => HealthState::not_ready(e.to_string()),
        }
    }

    async fn readiness(&self) -> HealthState {
        let live = self.liveness().await;
        if !live.is_ready() {
            return live;
        }
        match self.pending_migrations().await {
            Ok(pending) if pending.is_empty() => HealthState::Ready,
            Ok(pending) => HealthState::not_ready(format!("{} migrations pending", pending.len())),
            // no _sqlx_migrations table yet
            Err(_) => HealthState::not_ready("schema not initialised"),
        }
    }
}
