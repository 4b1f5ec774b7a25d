//! Runtime - handler の解決と期限付き実行

use std::sync::Arc;
use std::time::Duration;

use crate::domain::JobEnvelope;
use crate::error::WeaverError;
use crate::typed::{JobContext, TypedRegistry};

/// Fallback execution deadline.
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(300);

/// Executes one envelope by dispatching to its registered handler.
pub struct Runtime {
    registry: Arc<TypedRegistry>,
    default_timeout: Duration,
}

impl Runtime {
    pub fn new(registry: Arc<TypedRegistry>) -> Self {
        Self {
            registry,
            default_timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &TypedRegistry {
        &self.registry
    }

    pub fn deadline_for(&self, envelope: &JobEnvelope) -> Duration {
        envelope.timeout.unwrap_or(self.default_timeout)
    }

    /// Runs the handler under the job's deadline. Exceeding it drops (cancels)
    /// the handler future and yields `HandlerTimeout`.
    pub async fn execute(&self, envelope: &JobEnvelope) -> Result<(), WeaverError> {
        let handler = self
            .registry
            .get(&envelope.handler)
            .ok_or_else(|| WeaverError::HandlerNotFound(envelope.handler.clone()))?;

        let deadline = self.deadline_for(envelope);
        let ctx = JobContext::from_envelope(envelope);
        match tokio::time::timeout(deadline, handler.handle_dyn(envelope.payload.clone(), ctx)).await
        {
            Ok(result) => result,
            Err(_) => Err(WeaverError::HandlerTimeout(deadline)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppBuilder;
    use crate::domain::{EnqueueOptions, JobDefaults, JobId, NewJob};
    use assert_matches::assert_matches;
    use chrono::Utc;
    use serde_json::json;

    fn envelope(handler: &str, timeout: Option<Duration>) -> JobEnvelope {
        let mut options = EnqueueOptions::default();
        options.timeout = timeout;
        NewJob::new("default", handler, json!({}))
            .with_options(options)
            .into_envelope(JobId::generate(), Utc::now(), &JobDefaults::default())
    }

    fn runtime() -> Runtime {
        AppBuilder::new()
            .register_fn("ok", |_, _| async { Ok(()) })
            .unwrap()
            .register_fn("slow", |_, _| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .unwrap()
            .default_timeout(Duration::from_secs(10))
            .build()
            .unwrap()
            .runtime()
    }

    #[tokio::test]
    async fn executes_registered_handler() {
        runtime().execute(&envelope("ok", None)).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_handler_is_a_validation_error() {
        let err = runtime().execute(&envelope("missing", None)).await.unwrap_err();
        assert_matches!(err, WeaverError::HandlerNotFound(ref id) if id.as_str() == "missing");
        assert!(err.is_permanent());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_comes_from_envelope_or_default() {
        let rt = runtime();

        let err = rt
            .execute(&envelope("slow", Some(Duration::from_secs(2))))
            .await
            .unwrap_err();
        assert_matches!(err, WeaverError::HandlerTimeout(d) if d == Duration::from_secs(2));

        let err = rt.execute(&envelope("slow", None)).await.unwrap_err();
        assert_matches!(err, WeaverError::HandlerTimeout(d) if d == Duration::from_secs(10));
        assert!(!err.is_permanent());
    }
}
