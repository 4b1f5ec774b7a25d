//! weaver-core
//!
//! Background job runtime: broker protocol, worker pool with retries,
//! periodic scheduler and readiness-gated startup.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, envelope, lease, schedule, result, health, events）
//! - **ports**: 抽象化レイヤー（Broker, ResultStore, ScheduleStore, HealthProbe, Clock, など）
//! - **queue**: RetryPolicy と InMemoryBroker
//! - **app**: アプリケーションロジック（builder, runtime, worker_loop, scheduler, startup, producer）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry, PayloadCodec）
//! - **impls**: 開発用実装（InMemoryDatastore）
//! - **error**: WeaverError

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;
pub mod queue;
pub mod typed;

pub use self::error::WeaverError;
