//! Ports - 抽象化レイヤー
//!
//! worker / scheduler / startup coordinator はこの trait だけに依存する。
//! 実装は `queue`・`impls`（in-memory）と `weaver-pg`（PostgreSQL）にある。

pub mod broker;
pub mod clock;
pub mod event_sink;
pub mod health_probe;
pub mod id_generator;
pub mod result_store;
pub mod schedule_store;

pub use self::broker::Broker;
pub use self::clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use self::event_sink::{EventSink, NoopEventSink, RecordingEventSink, TracingEventSink};
pub use self::health_probe::HealthProbe;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::result_store::ResultStore;
pub use self::schedule_store::{ScheduleStore, SchedulerLock};
