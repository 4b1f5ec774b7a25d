//! Impls - 実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryDatastore**: ResultStore / ScheduleStore / HealthProbe
//! - **InMemorySchedulerLock**: SchedulerLock（`InMemoryDatastore::scheduler_lock()`）
//! - InMemoryBroker は `queue` にある
//!
//! # 本番用実装
//! - `weaver-pg`: PgBroker, PgDatastore

pub mod inmem_datastore;

pub use self::inmem_datastore::{InMemoryDatastore, InMemorySchedulerLock};
