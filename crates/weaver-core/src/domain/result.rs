//! ExecutionResult / DeadLetterEntry - 実行結果の記録

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::{HandlerId, JobEnvelope, QueueName};
use super::ids::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOutcome {
    Success,
    Failure,
    RetryScheduled,
}

impl ResultOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::RetryScheduled => "retry_scheduled",
        }
    }

    /// Only terminal outcomes are persisted.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::RetryScheduled)
    }
}

impl fmt::Display for ResultOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "retry_scheduled" => Ok(Self::RetryScheduled),
            other => Err(format!("unknown outcome `{other}`")),
        }
    }
}

/// Append-only record of a terminal attempt. At most one per job id and
/// generation, so a replayed dead letter gets its own row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job_id: JobId,
    #[serde(default)]
    pub generation: u32,
    pub queue: QueueName,
    pub handler: HandlerId,
    pub outcome: ResultOutcome,
    pub error: Option<String>,
    pub delivery_count: u32,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn success(envelope: &JobEnvelope, completed_at: DateTime<Utc>) -> Self {
        Self::from_envelope(envelope, ResultOutcome::Success, None, completed_at)
    }

    pub fn failure(
        envelope: &JobEnvelope,
        error: impl Into<String>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self::from_envelope(envelope, ResultOutcome::Failure, Some(error.into()), completed_at)
    }

    fn from_envelope(
        envelope: &JobEnvelope,
        outcome: ResultOutcome,
        error: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: envelope.id,
            generation: envelope.generation,
            queue: envelope.queue.clone(),
            handler: envelope.handler.clone(),
            outcome,
            error,
            delivery_count: envelope.delivery_count,
            completed_at,
        }
    }
}

/// A job that exhausted its retry budget, kept for inspection and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub envelope: JobEnvelope,
    pub error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ResultOutcome::Success)]
    #[case(ResultOutcome::Failure)]
    #[case(ResultOutcome::RetryScheduled)]
    fn outcome_text_matches_serde(#[case] outcome: ResultOutcome) {
        let json = serde_json::to_string(&outcome).unwrap();
        assert_eq!(json, format!("\"{}\"", outcome.as_str()));
        assert_eq!(outcome.as_str().parse::<ResultOutcome>().unwrap(), outcome);
    }

    #[test]
    fn only_retry_scheduled_is_not_terminal() {
        assert!(ResultOutcome::Success.is_terminal());
        assert!(ResultOutcome::Failure.is_terminal());
        assert!(!ResultOutcome::RetryScheduled.is_terminal());
    }
}
