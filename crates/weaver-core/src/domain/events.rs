//! Events - ドメインイベント
//!
//! worker / scheduler / producer が発行する status callback。
//! EventSink 経由でログや外部システムに流す。

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::envelope::{HandlerId, QueueName};
use super::ids::JobId;

#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    JobEnqueued {
        job_id: JobId,
        queue: QueueName,
        handler: HandlerId,
    },
    JobLeased {
        job_id: JobId,
        queue: QueueName,
        delivery_count: u32,
    },
    JobSucceeded {
        job_id: JobId,
        queue: QueueName,
        delivery_count: u32,
    },
    RetryScheduled {
        job_id: JobId,
        queue: QueueName,
        delivery_count: u32,
        delay: Duration,
        error: String,
    },
    JobDeadLettered {
        job_id: JobId,
        queue: QueueName,
        delivery_count: u32,
        error: String,
    },
    ScheduleFired {
        schedule: String,
        job_id: JobId,
        fired_at: DateTime<Utc>,
    },
    ScheduleFailed {
        schedule: String,
        error: String,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobEnqueued { .. } => "job_enqueued",
            Self::JobLeased { .. } => "job_leased",
            Self::JobSucceeded { .. } => "job_succeeded",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::JobDeadLettered { .. } => "job_dead_lettered",
            Self::ScheduleFired { .. } => "schedule_fired",
            Self::ScheduleFailed { .. } => "schedule_failed",
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobEnqueued { job_id, .. }
            | Self::JobLeased { job_id, .. }
            | Self::JobSucceeded { job_id, .. }
            | Self::RetryScheduled { job_id, .. }
            | Self::JobDeadLettered { job_id, .. }
            | Self::ScheduleFired { job_id, .. } => Some(*job_id),
            Self::ScheduleFailed { .. } => None,
        }
    }
}
