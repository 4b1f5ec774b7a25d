//! Domain model (IDs, envelopes, schedules, results, events).

pub mod envelope;
pub mod errors;
pub mod events;
pub mod health;
pub mod ids;
pub mod lease;
pub mod result;
pub mod schedule;
pub mod time;

pub use self::envelope::{
    EnqueueOptions, HandlerId, JobDefaults, JobEnvelope, MAX_PAYLOAD_BYTES, NewJob, QueueName,
};
pub use self::errors::ErrorKind;
pub use self::events::DomainEvent;
pub use self::health::HealthState;
pub use self::ids::{JobId, LeaseToken};
pub use self::lease::Lease;
pub use self::result::{DeadLetterEntry, ExecutionResult, ResultOutcome};
pub use self::schedule::{
    EntryState, Recurrence, RecurrenceError, ScheduleDefinition, ScheduleEntry,
};
