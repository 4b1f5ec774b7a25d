//! PgBroker - `weaver_jobs` テーブル上の broker
//!
//! 時刻はすべて DB の `now()` を使う（プロセス間の時計ずれを持ち込まない）。
//! ack / nack / dead-letter は `lease_token` と `lease_expires_at > now()` で守られ、
//! 0 行更新なら LeaseExpired。
//! claim した行が envelope に戻せない（壊れている）ときはその場で dead に落とす。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use weaver_core::WeaverError;
use weaver_core::app::QueueCounts;
use weaver_core::domain::{
    DeadLetterEntry, HandlerId, JobEnvelope, JobId, Lease, LeaseToken, NewJob, QueueName,
};
use weaver_core::ports::{Broker, IdGenerator, SystemClock, UlidGenerator};
use weaver_core::queue::{BrokerConfig, RetryPolicy};

use crate::{PgConfig, broker_error, millis};

const COLUMNS: &str = "\
    id, queue, handler, payload, delivery_count, generation, max_retries, retry_policy, \
    timeout_ms, enqueued_at, available_at, lease_expires_at, last_error, dead_lettered_at";

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: String,
    queue: String,
    handler: String,
    payload: serde_json::Value,
    delivery_count: i32,
    generation: i32,
    max_retries: i32,
    retry_policy: Json<RetryPolicy>,
    timeout_ms: Option<i64>,
    enqueued_at: DateTime<Utc>,
    available_at: DateTime<Utc>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    dead_lettered_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_envelope(self) -> Result<JobEnvelope, WeaverError> {
        let id = self
            .id
            .parse::<JobId>()
            .map_err(|e| WeaverError::Datastore(format!("bad job id `{}`: {e}", self.id)))?;
        Ok(JobEnvelope {
            id,
            queue: QueueName::new(self.queue),
            handler: HandlerId::new(self.handler),
            payload: self.payload,
            enqueued_at: self.enqueued_at,
            available_at: self.available_at,
            delivery_count: u32::try_from(self.delivery_count).unwrap_or(0),
            generation: u32::try_from(self.generation).unwrap_or(0),
            max_retries: u32::try_from(self.max_retries).unwrap_or(0),
            retry: self.retry_policy.0,
            timeout: self
                .timeout_ms
                .and_then(|ms| u64::try_from(ms).ok())
                .map(Duration::from_millis),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CountsRow {
    ready: i64,
    delayed: i64,
    leased: i64,
    dead: i64,
}

/// Broker backed by PostgreSQL. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
    config: BrokerConfig,
    poll_interval: Duration,
    ids: Arc<dyn IdGenerator>,
}

impl PgBroker {
    pub fn new(pool: PgPool, pg: &PgConfig, config: BrokerConfig) -> Self {
        Self {
            pool,
            config,
            poll_interval: pg.poll_interval,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Expired leases go back to `ready` and count as a delivery.
    async fn reclaim_expired(&self, queue: &QueueName) -> Result<u64, WeaverError> {
        let reclaimed = sqlx::query(
            "UPDATE weaver_jobs \
             SET state = 'ready', delivery_count = delivery_count + 1, \
                 lease_token = NULL, lease_expires_at = NULL, \
                 last_error = COALESCE(last_error, 'lease expired') \
             WHERE queue = $1 AND state = 'leased' AND lease_expires_at <= now()",
        )
        .bind(queue.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| broker_error("reclaim_expired", e))?
        .rows_affected();
        if reclaimed > 0 {
            debug!(queue = %queue, reclaimed, "expired leases reclaimed");
        }
        Ok(reclaimed)
    }

    /// Claims the oldest visible row. Rows that do not decode are buried and
    /// the next one is tried.
    async fn claim_one(&self, queue: &QueueName) -> Result<Option<Lease>, WeaverError> {
        loop {
            let token = self.ids.generate_lease_token();
            let Some(row) = self.claim_row(queue, token).await? else {
                return Ok(None);
            };

            let raw_id = row.id.clone();
            let expires_at = row.lease_expires_at.unwrap_or_else(Utc::now);
            match row.into_envelope() {
                Ok(envelope) => {
                    return Ok(Some(Lease {
                        envelope,
                        token,
                        expires_at,
                    }));
                }
                Err(err) => self.bury(&raw_id, token, &err).await?,
            }
        }
    }

    async fn claim_row(
        &self,
        queue: &QueueName,
        token: LeaseToken,
    ) -> Result<Option<JobRow>, WeaverError> {
        let query = format!(
            "UPDATE weaver_jobs \
             SET state = 'leased', lease_token = $2, \
                 lease_expires_at = now() + ($3 * INTERVAL '1 millisecond') \
             WHERE id = ( \
                 SELECT id FROM weaver_jobs \
                 WHERE queue = $1 AND state = 'ready' AND available_at <= now() \
                 ORDER BY available_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(queue.as_str())
            .bind(token.to_ulid_string())
            .bind(millis(self.config.visibility_timeout))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| broker_error("lease", e))
    }

    /// Moves a claimed row that cannot become an envelope straight to `dead`.
    async fn bury(
        &self,
        raw_id: &str,
        token: LeaseToken,
        err: &WeaverError,
    ) -> Result<(), WeaverError> {
        warn!(job_id = raw_id, error = %err, "undecodable job row, dead-lettering");
        sqlx::query(
            "UPDATE weaver_jobs \
             SET state = 'dead', dead_lettered_at = now(), last_error = $3, \
                 lease_token = NULL, lease_expires_at = NULL \
             WHERE id = $1 AND lease_token = $2",
        )
        .bind(raw_id)
        .bind(token.to_ulid_string())
        .bind(err.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| broker_error("bury", e))?;
        Ok(())
    }

    /// Zero rows affected by a lease-guarded statement means the caller lost the lease.
    fn guarded(job_id: JobId, rows: u64) -> Result<(), WeaverError> {
        if rows == 0 {
            Err(WeaverError::LeaseExpired { job_id })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Broker for PgBroker {
    #[instrument(skip(self, job), fields(queue = %job.queue, handler = %job.handler), err)]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, WeaverError> {
        job.validate()?;

        let id = self.ids.generate_job_id();
        let delay = job.options.delay.unwrap_or(Duration::ZERO);
        let envelope = job.into_envelope(id, Utc::now(), &self.config.defaults);

        sqlx::query(
            "INSERT INTO weaver_jobs \
                 (id, queue, handler, payload, max_retries, retry_policy, timeout_ms, \
                  enqueued_at, available_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, now(), now() + ($8 * INTERVAL '1 millisecond'))",
        )
        .bind(id.to_ulid_string())
        .bind(envelope.queue.as_str())
        .bind(envelope.handler.as_str())
        .bind(&envelope.payload)
        .bind(i32::try_from(envelope.max_retries).unwrap_or(i32::MAX))
        .bind(Json(&envelope.retry))
        .bind(envelope.timeout.map(millis))
        .bind(millis(delay))
        .execute(&self.pool)
        .await
        .map_err(|e| broker_error("enqueue", e))?;

        Ok(id)
    }

    #[instrument(skip(self), err)]
    async fn lease(
        &self,
        queue: &QueueName,
        count: usize,
        timeout: Duration,
    ) -> Result<Vec<Lease>, WeaverError> {
        let deadline = Instant::now() + timeout;
        let count = count.max(1);

        loop {
            self.reclaim_expired(queue).await?;

            let mut leases = Vec::new();
            while leases.len() < count {
                match self.claim_one(queue).await? {
                    Some(lease) => leases.push(lease),
                    None => break,
                }
            }
            if !leases.is_empty() {
                return Ok(leases);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(leases);
            }
            tokio::time::sleep_until((now + self.poll_interval).min(deadline)).await;
        }
    }

    #[instrument(skip(self), err)]
    async fn ack(&self, job_id: JobId, token: LeaseToken) -> Result<(), WeaverError> {
        let rows = sqlx::query(
            "DELETE FROM weaver_jobs \
             WHERE id = $1 AND state = 'leased' AND lease_token = $2 AND lease_expires_at > now()",
        )
        .bind(job_id.to_ulid_string())
        .bind(token.to_ulid_string())
        .execute(&self.pool)
        .await
        .map_err(|e| broker_error("ack", e))?
        .rows_affected();
        Self::guarded(job_id, rows)
    }

    #[instrument(skip(self), err)]
    async fn extend_lease(
        &self,
        job_id: JobId,
        token: LeaseToken,
    ) -> Result<DateTime<Utc>, WeaverError> {
        let extended: Option<DateTime<Utc>> = sqlx::query_scalar(
            "UPDATE weaver_jobs \
             SET lease_expires_at = now() + ($3 * INTERVAL '1 millisecond') \
             WHERE id = $1 AND state = 'leased' AND lease_token = $2 AND lease_expires_at > now() \
             RETURNING lease_expires_at",
        )
        .bind(job_id.to_ulid_string())
        .bind(token.to_ulid_string())
        .bind(millis(self.config.visibility_timeout))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| broker_error("extend_lease", e))?;
        extended.ok_or(WeaverError::LeaseExpired { job_id })
    }

    #[instrument(skip(self), err)]
    async fn nack(
        &self,
        job_id: JobId,
        token: LeaseToken,
        delay: Duration,
        error: &str,
    ) -> Result<(), WeaverError> {
        let rows = sqlx::query(
            "UPDATE weaver_jobs \
             SET state = 'ready', delivery_count = delivery_count + 1, \
                 available_at = now() + ($3 * INTERVAL '1 millisecond'), \
                 lease_token = NULL, lease_expires_at = NULL, last_error = $4 \
             WHERE id = $1 AND state = 'leased' AND lease_token = $2 AND lease_expires_at > now()",
        )
        .bind(job_id.to_ulid_string())
        .bind(token.to_ulid_string())
        .bind(millis(delay))
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| broker_error("nack", e))?
        .rows_affected();
        Self::guarded(job_id, rows)
    }

    #[instrument(skip(self), err)]
    async fn dead_letter(
        &self,
        job_id: JobId,
        token: LeaseToken,
        error: &str,
    ) -> Result<(), WeaverError> {
        let rows = sqlx::query(
            "UPDATE weaver_jobs \
             SET state = 'dead', dead_lettered_at = now(), last_error = $3, \
                 lease_token = NULL, lease_expires_at = NULL \
             WHERE id = $1 AND state = 'leased' AND lease_token = $2 AND lease_expires_at > now()",
        )
        .bind(job_id.to_ulid_string())
        .bind(token.to_ulid_string())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| broker_error("dead_letter", e))?
        .rows_affected();
        Self::guarded(job_id, rows)
    }

    async fn dead_letters(
        &self,
        queue: &QueueName,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, WeaverError> {
        let query = format!(
            "SELECT {COLUMNS} FROM weaver_jobs \
             WHERE queue = $1 AND state = 'dead' \
             ORDER BY dead_lettered_at ASC \
             LIMIT $2"
        );
        let rows = sqlx::query_as::<_, JobRow>(&query)
            .bind(queue.as_str())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| broker_error("dead_letters", e))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let raw_id = row.id.clone();
            let error = row.last_error.clone().unwrap_or_default();
            let dead_lettered_at = row.dead_lettered_at.unwrap_or(row.available_at);
            match row.into_envelope() {
                Ok(envelope) => entries.push(DeadLetterEntry {
                    envelope,
                    error,
                    dead_lettered_at,
                }),
                // 壊れた行は replay できないので一覧に出さない
                Err(e) => warn!(job_id = raw_id, error = %e, "skipping undecodable dead letter"),
            }
        }
        Ok(entries)
    }

    #[instrument(skip(self), err)]
    async fn replay_dead_letter(&self, job_id: JobId) -> Result<(), WeaverError> {
        let rows = sqlx::query(
            "UPDATE weaver_jobs \
             SET state = 'ready', delivery_count = 0, generation = generation + 1, \
                 available_at = now(), dead_lettered_at = NULL, last_error = NULL \
             WHERE id = $1 AND state = 'dead'",
        )
        .bind(job_id.to_ulid_string())
        .execute(&self.pool)
        .await
        .map_err(|e| broker_error("replay_dead_letter", e))?
        .rows_affected();

        if rows == 0 {
            return Err(WeaverError::validation(format!(
                "{job_id} is not in the dead-letter sink"
            )));
        }
        Ok(())
    }

    async fn counts(&self, queue: &QueueName) -> Result<QueueCounts, WeaverError> {
        let row = sqlx::query_as::<_, CountsRow>(
            "SELECT \
                 COUNT(*) FILTER (WHERE state = 'ready' AND available_at <= now()) AS ready, \
                 COUNT(*) FILTER (WHERE state = 'ready' AND available_at > now()) AS delayed, \
                 COUNT(*) FILTER (WHERE state = 'leased') AS leased, \
                 COUNT(*) FILTER (WHERE state = 'dead') AS dead \
             FROM weaver_jobs WHERE queue = $1",
        )
        .bind(queue.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| broker_error("counts", e))?;

        let to_u64 = |n: i64| u64::try_from(n).unwrap_or(0);
        Ok(QueueCounts {
            ready: to_u64(row.ready),
            delayed: to_u64(row.delayed),
            leased: to_u64(row.leased),
            dead: to_u64(row.dead),
        })
    }

    async fn ping(&self) -> Result<(), WeaverError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| broker_error("ping", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use weaver_core::domain::EnqueueOptions;

    fn row(id: String) -> JobRow {
        JobRow {
            id,
            queue: "emails".into(),
            handler: "mail.send".into(),
            payload: json!({"to": "a@example.com"}),
            delivery_count: 2,
            generation: 1,
            max_retries: 5,
            retry_policy: Json(RetryPolicy::immediate()),
            timeout_ms: Some(1_500),
            enqueued_at: Utc::now(),
            available_at: Utc::now(),
            lease_expires_at: None,
            last_error: None,
            dead_lettered_at: None,
        }
    }

    #[test]
    fn rows_map_to_envelopes() {
        let id = JobId::generate();
        let envelope = row(id.to_ulid_string()).into_envelope().unwrap();
        assert_eq!(envelope.id, id);
        assert_eq!((envelope.delivery_count, envelope.generation), (2, 1));
        assert_eq!(envelope.timeout, Some(Duration::from_millis(1_500)));
        assert_eq!(envelope.retry, RetryPolicy::immediate());
    }

    #[test]
    fn corrupt_ids_are_datastore_errors() {
        assert_matches!(
            row("nope".into()).into_envelope(),
            Err(WeaverError::Datastore(_))
        );
    }

    async fn broker() -> Option<PgBroker> {
        let url = std::env::var("WEAVER_TEST_DATABASE_URL").ok()?;
        let config = PgConfig::new(url);
        let pool = crate::connect(&config).ok()?;
        crate::MIGRATOR.run(&pool).await.ok()?;
        Some(PgBroker::new(
            pool,
            &config.with_poll_interval(Duration::from_millis(50)),
            BrokerConfig::default().with_visibility_timeout(Duration::from_secs(1)),
        ))
    }

    fn unique_queue(prefix: &str) -> QueueName {
        QueueName::new(format!("{prefix}-{}", JobId::generate().to_ulid_string()))
    }

    #[tokio::test]
    #[ignore = "needs WEAVER_TEST_DATABASE_URL"]
    async fn lease_ack_round() {
        let Some(broker) = broker().await else { return };
        let queue = unique_queue("round");
        let id = broker
            .enqueue(NewJob::new(queue.clone(), "mail.send", json!({"n": 1})))
            .await
            .unwrap();

        let leases = broker.lease(&queue, 5, Duration::from_secs(1)).await.unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].job_id(), id);
        assert!(broker.lease(&queue, 1, Duration::from_millis(200)).await.unwrap().is_empty());

        broker.ack(id, leases[0].token).await.unwrap();
        assert_eq!(broker.counts(&queue).await.unwrap().total(), 0);
    }

    #[tokio::test]
    #[ignore = "needs WEAVER_TEST_DATABASE_URL"]
    async fn expired_lease_is_reclaimed_and_old_token_rejected() {
        let Some(broker) = broker().await else { return };
        let queue = unique_queue("expiry");
        broker
            .enqueue(NewJob::new(queue.clone(), "mail.send", json!({})))
            .await
            .unwrap();

        let first = broker.lease(&queue, 1, Duration::from_secs(1)).await.unwrap().remove(0);
        let second = broker.lease(&queue, 1, Duration::from_secs(3)).await.unwrap().remove(0);
        assert_eq!(second.job_id(), first.job_id());
        assert_eq!(second.envelope.delivery_count, 1);

        assert_matches!(
            broker.ack(first.job_id(), first.token).await,
            Err(WeaverError::LeaseExpired { .. })
        );
        broker.ack(second.job_id(), second.token).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs WEAVER_TEST_DATABASE_URL"]
    async fn nack_delay_and_dead_letter_replay() {
        let Some(broker) = broker().await else { return };
        let queue = unique_queue("dead");
        let id = broker
            .enqueue(
                NewJob::new(queue.clone(), "mail.send", json!({}))
                    .with_options(EnqueueOptions::default().with_max_retries(0)),
            )
            .await
            .unwrap();

        let lease = broker.lease(&queue, 1, Duration::from_secs(1)).await.unwrap().remove(0);
        broker
            .nack(id, lease.token, Duration::from_secs(60), "boom")
            .await
            .unwrap();
        assert_eq!(broker.counts(&queue).await.unwrap().delayed, 1);

        sqlx::query("UPDATE weaver_jobs SET available_at = now() WHERE id = $1")
            .bind(id.to_ulid_string())
            .execute(broker.pool())
            .await
            .unwrap();
        let lease = broker.lease(&queue, 1, Duration::from_secs(1)).await.unwrap().remove(0);
        broker.dead_letter(id, lease.token, "gave up").await.unwrap();

        let dead = broker.dead_letters(&queue, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error, "gave up");

        broker.replay_dead_letter(id).await.unwrap();
        let replayed = broker.lease(&queue, 1, Duration::from_secs(1)).await.unwrap().remove(0);
        assert_eq!(replayed.envelope.delivery_count, 0);
        assert_eq!(replayed.envelope.generation, 1);
        broker.ack(id, replayed.token).await.unwrap();
    }

    #[tokio::test]
    #[ignore = "needs WEAVER_TEST_DATABASE_URL"]
    async fn extended_lease_survives_its_first_deadline() {
        let Some(broker) = broker().await else { return };
        let queue = unique_queue("extend");
        let id = broker
            .enqueue(NewJob::new(queue.clone(), "mail.send", json!({})))
            .await
            .unwrap();

        let lease = broker.lease(&queue, 1, Duration::from_secs(1)).await.unwrap().remove(0);
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(600)).await;
            let extended = broker.extend_lease(id, lease.token).await.unwrap();
            assert!(extended > lease.expires_at);
        }
        broker.ack(id, lease.token).await.unwrap();

        assert_matches!(
            broker.extend_lease(id, lease.token).await,
            Err(WeaverError::LeaseExpired { .. })
        );
    }

    #[tokio::test]
    #[ignore = "needs WEAVER_TEST_DATABASE_URL"]
    async fn undecodable_rows_are_dead_lettered_instead_of_leased() {
        let Some(broker) = broker().await else { return };
        let queue = unique_queue("corrupt");
        let bad_id = format!("corrupt-{}", JobId::generate().to_ulid_string());
        sqlx::query(
            "INSERT INTO weaver_jobs \
                 (id, queue, handler, payload, max_retries, retry_policy, enqueued_at, available_at) \
             VALUES ($1, $2, 'mail.send', '{}', 0, $3, now(), now())",
        )
        .bind(&bad_id)
        .bind(queue.as_str())
        .bind(Json(RetryPolicy::immediate()))
        .execute(broker.pool())
        .await
        .unwrap();
        let good = broker
            .enqueue(NewJob::new(queue.clone(), "mail.send", json!({})))
            .await
            .unwrap();

        let leases = broker.lease(&queue, 5, Duration::from_millis(200)).await.unwrap();
        assert_eq!(leases.iter().map(Lease::job_id).collect::<Vec<_>>(), vec![good]);

        let state: String = sqlx::query_scalar("SELECT state FROM weaver_jobs WHERE id = $1")
            .bind(&bad_id)
            .fetch_one(broker.pool())
            .await
            .unwrap();
        assert_eq!(state, "dead");
        assert!(broker.dead_letters(&queue, 10).await.unwrap().is_empty());
    }
}
