//! PgSchedulerLock - session advisory lock
//!
//! advisory lock は session に紐づくので、取れた connection を pool に返さず持ち続ける。
//! プロセスが落ちれば connection ごと lock も消える。
//! connection が切れたら lock も消えているので、持っているかは pg_locks で毎回確かめる。

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use weaver_core::WeaverError;
use weaver_core::ports::SchedulerLock;

use crate::datastore_error;

/// `"WEAVER"` in ASCII.
pub const SCHEDULER_LOCK_KEY: i64 = 0x5745_4156_4552;

pub struct PgSchedulerLock {
    pool: PgPool,
    key: i64,
    conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgSchedulerLock {
    pub fn new(pool: PgPool) -> Self {
        Self::with_key(pool, SCHEDULER_LOCK_KEY)
    }

    /// Separate deployments sharing one database need distinct keys.
    pub fn with_key(pool: PgPool, key: i64) -> Self {
        Self {
            pool,
            key,
            conn: Mutex::new(None),
        }
    }

    /// Whether the session behind `conn` still holds the advisory lock.
    async fn session_holds(
        &self,
        conn: &mut PoolConnection<Postgres>,
    ) -> Result<bool, sqlx::Error> {
        // bigint key は classid (上位 32bit) / objid (下位 32bit) / objsubid = 1 で載る
        sqlx::query_scalar(
            "SELECT EXISTS ( \
                 SELECT 1 FROM pg_locks \
                 WHERE locktype = 'advisory' AND pid = pg_backend_pid() AND granted \
                   AND classid::bigint = $1 AND objid::bigint = $2 AND objsubid = 1 \
             )",
        )
        .bind((self.key >> 32) & 0xFFFF_FFFF)
        .bind(self.key & 0xFFFF_FFFF)
        .fetch_one(&mut **conn)
        .await
    }

    /// Checks the held session. A broken or lock-less session is dropped.
    async fn verify(
        &self,
        held: &mut Option<PoolConnection<Postgres>>,
    ) -> Result<bool, WeaverError> {
        let Some(conn) = held.as_mut() else {
            return Ok(false);
        };
        match self.session_holds(conn).await {
            Ok(true) => Ok(true),
            Ok(false) => {
                warn!(key = self.key, "scheduler lock no longer held by this session");
                *held = None;
                Ok(false)
            }
            Err(e) => {
                if let Some(conn) = held.take() {
                    drop(conn.detach());
                }
                Err(datastore_error("scheduler_lock_check", e))
            }
        }
    }
}

#[async_trait]
impl SchedulerLock for PgSchedulerLock {
    async fn try_acquire(&self) -> Result<bool, WeaverError> {
        let mut held = self.conn.lock().await;
        if held.is_some() && self.verify(&mut held).await? {
            return Ok(true);
        }

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| datastore_error("scheduler_lock", e))?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| datastore_error("scheduler_lock", e))?;

        if acquired {
            info!(key = self.key, "scheduler lock acquired");
            *held = Some(conn);
        } else {
            debug!(key = self.key, "scheduler lock held elsewhere");
        }
        Ok(acquired)
    }

    async fn is_held(&self) -> Result<bool, WeaverError> {
        let mut held = self.conn.lock().await;
        self.verify(&mut held).await
    }

    async fn release(&self) -> Result<(), WeaverError> {
        let Some(mut conn) = self.conn.lock().await.take() else {
            return Ok(());
        };
        let released: bool = match sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(released) => released,
            Err(e) => {
                // pool に戻すと lock を握ったままの session が残るので切断する
                drop(conn.detach());
                return Err(datastore_error("scheduler_unlock", e));
            }
        };
        if released {
            info!(key = self.key, "scheduler lock released");
        }
        Ok(())
    }
}
