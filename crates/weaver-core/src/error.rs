use std::time::Duration;

use thiserror::Error;

use crate::domain::errors::ErrorKind;
use crate::domain::{HandlerId, JobId};

/// Errors surfaced by brokers, stores, handlers and the startup path.
#[derive(Debug, Clone, Error)]
pub enum WeaverError {
    /// Transport could not be reached within the connect timeout.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The caller no longer holds the lease (it expired or was superseded).
    #[error("lease expired for {job_id}")]
    LeaseExpired { job_id: JobId },

    #[error("handler failed: {0}")]
    HandlerFailure(String),

    #[error("handler exceeded its {0:?} deadline")]
    HandlerTimeout(Duration),

    #[error("dependency `{dependency}` not ready after {waited:?}: {reason}")]
    DependencyNotReady {
        dependency: String,
        waited: Duration,
        reason: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("handler not found for handler={0}")]
    HandlerNotFound(HandlerId),

    #[error("duplicate handler for handler={0}")]
    DuplicateHandler(HandlerId),

    #[error("datastore error: {0}")]
    Datastore(String),

    #[error("{0}")]
    Other(String),
}

impl WeaverError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self::HandlerFailure(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// 運用分類。retry engine はこれだけを見て retry / dead-letter を決める。
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BrokerUnavailable(_) | Self::Datastore(_) => ErrorKind::Infrastructure,
            Self::Validation(_)
            | Self::HandlerNotFound(_)
            | Self::DuplicateHandler(_)
            | Self::DependencyNotReady { .. } => ErrorKind::Permanent,
            Self::LeaseExpired { .. }
            | Self::HandlerFailure(_)
            | Self::HandlerTimeout(_)
            | Self::Other(_) => ErrorKind::Transient,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind() == ErrorKind::Permanent
    }
}

impl From<serde_json::Error> for WeaverError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("json: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::broker(WeaverError::BrokerUnavailable("down".into()), ErrorKind::Infrastructure)]
    #[case::datastore(WeaverError::Datastore("pool".into()), ErrorKind::Infrastructure)]
    #[case::handler(WeaverError::handler("boom"), ErrorKind::Transient)]
    #[case::timeout(WeaverError::HandlerTimeout(Duration::from_secs(1)), ErrorKind::Transient)]
    #[case::validation(WeaverError::validation("bad"), ErrorKind::Permanent)]
    #[case::unknown_handler(WeaverError::HandlerNotFound(HandlerId::new("nope")), ErrorKind::Permanent)]
    fn errors_are_classified(#[case] err: WeaverError, #[case] expected: ErrorKind) {
        assert_eq!(err.kind(), expected);
    }

    #[test]
    fn json_errors_are_validation() {
        let err: WeaverError = serde_json::from_str::<u32>("\"x\"").unwrap_err().into();
        assert!(err.is_permanent());
        assert!(err.to_string().starts_with("validation failed: json:"));
    }
}
