//! App - アプリケーション層
//!
//! ports を組み合わせて各プロセスロールの本体を実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: handler 登録と起動時検証
//! - **Runtime**: handler の解決と期限付き実行
//! - **WorkerPool**: lease → execute → ack / nack / dead-letter
//! - **PeriodicScheduler**: 定期ジョブの tick loop
//! - **StartupPlan**: ロールごとの readiness gate
//! - **Producer**: enqueue の入り口

pub mod builder;
pub mod producer;
pub mod runtime;
pub mod scheduler;
pub mod startup;
pub mod status;
pub mod worker_loop;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::producer::{Producer, ProducerConfig};
pub use self::runtime::{Runtime, DEFAULT_JOB_TIMEOUT};
pub use self::scheduler::{PeriodicScheduler, SchedulerConfig, SchedulerDeps, TickReport};
pub use self::startup::{
    BrokerReachable, DatastoreLive, DatastoreReady, Dependency, ReadinessPolicy, Role,
    StartupCoordinator, StartupPlan,
};
pub use self::status::{QueueCounts, WorkerStats, WorkerStatsSnapshot};
pub use self::worker_loop::{WorkerConfig, WorkerDeps, WorkerPool};
