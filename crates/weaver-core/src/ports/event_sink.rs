//! EventSink port - status callback の出口
//!
//! - NoopEventSink: 何もしない
//! - TracingEventSink: tracing のログとして出す（CLI のデフォルト）
//! - RecordingEventSink: メモリに貯める（テスト・デモ用）

use std::sync::Mutex;

use tracing::{info, warn};

use crate::domain::DomainEvent;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: DomainEvent) {}
}

#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: DomainEvent) {
        let name = event.name();
        match event {
            DomainEvent::JobEnqueued { job_id, queue, handler } => {
                info!(event = name, job_id = %job_id, queue = %queue, handler = %handler, "job enqueued");
            }
            DomainEvent::JobLeased { job_id, queue, delivery_count } => {
                info!(event = name, job_id = %job_id, queue = %queue, delivery_count, "job leased");
            }
            DomainEvent::JobSucceeded { job_id, queue, delivery_count } => {
                info!(event = name, job_id = %job_id, queue = %queue, delivery_count, "job succeeded");
            }
            DomainEvent::RetryScheduled { job_id, queue, delivery_count, delay, error } => {
                warn!(
                    event = name,
                    job_id = %job_id,
                    queue = %queue,
                    delivery_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retry scheduled"
                );
            }
            DomainEvent::JobDeadLettered { job_id, queue, delivery_count, error } => {
                warn!(event = name, job_id = %job_id, queue = %queue, delivery_count, error = %error, "job dead-lettered");
            }
            DomainEvent::ScheduleFired { schedule, job_id, fired_at } => {
                info!(event = name, schedule = %schedule, job_id = %job_id, fired_at = %fired_at, "schedule fired");
            }
            DomainEvent::ScheduleFailed { schedule, error } => {
                warn!(event = name, schedule = %schedule, error = %error, "schedule enqueue failed");
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of recorded events with the given `DomainEvent::name`.
    pub fn count(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: DomainEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}
