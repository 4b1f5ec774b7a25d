//! Built-in handlers for smoke testing a deployment.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use weaver_core::WeaverError;
use weaver_core::app::{App, AppBuilder, BuildError};
use weaver_core::typed::{Handler, JobContext, Task};

pub const ECHO: &str = "weaver.echo";
pub const FAIL: &str = "weaver.fail";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sleep {
    pub ms: u64,
}

impl Task for Sleep {
    const TYPE: &'static str = "weaver.sleep";
}

struct SleepHandler;

#[async_trait]
impl Handler<Sleep> for SleepHandler {
    async fn handle(&self, task: Sleep, ctx: JobContext) -> Result<(), WeaverError> {
        tokio::time::sleep(Duration::from_millis(task.ms)).await;
        info!(job_id = %ctx.job_id, ms = task.ms, "slept");
        Ok(())
    }
}

pub fn builtin_app(default_timeout: Option<Duration>) -> Result<App, BuildError> {
    let builder = AppBuilder::new()
        .register::<Sleep, _>(SleepHandler)?
        .register_fn(ECHO, |payload, ctx: JobContext| async move {
            info!(
                job_id = %ctx.job_id,
                queue = %ctx.queue,
                delivery_count = ctx.delivery_count,
                payload = %payload,
                "echo"
            );
            Ok::<(), WeaverError>(())
        })?
        .register_fn(FAIL, |_payload, ctx: JobContext| async move {
            Err::<(), _>(WeaverError::handler(format!(
                "{FAIL} always fails (delivery {})",
                ctx.delivery_count
            )))
        })?
        .expect_tasks(&[ECHO, FAIL, Sleep::TYPE]);

    match default_timeout {
        Some(timeout) => builder.default_timeout(timeout).build(),
        None => builder.build(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;
    use serde_json::json;
    use weaver_core::domain::{JobDefaults, JobId, NewJob};

    fn envelope(handler: &str, payload: serde_json::Value) -> weaver_core::domain::JobEnvelope {
        NewJob::new("default", handler, payload).into_envelope(
            JobId::generate(),
            Utc::now(),
            &JobDefaults::default(),
        )
    }

    #[test]
    fn registers_every_builtin() {
        let app = builtin_app(None).unwrap();
        let mut types = app.registry().registered_types();
        types.sort();
        assert_eq!(types, vec!["weaver.echo", "weaver.fail", "weaver.sleep"]);
    }

    #[rstest]
    #[case(ECHO, json!({"hello": "world"}), true)]
    #[case(FAIL, json!({}), false)]
    #[case("weaver.sleep", json!({"ms": 5}), true)]
    #[case("weaver.sleep", json!({"seconds": 5}), false)]
    #[tokio::test(start_paused = true)]
    async fn builtin_outcomes(
        #[case] handler: &str,
        #[case] payload: serde_json::Value,
        #[case] ok: bool,
    ) {
        let runtime = builtin_app(None).unwrap().runtime();
        let result = runtime.execute(&envelope(handler, payload)).await;
        assert_eq!(result.is_ok(), ok, "{result:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_respects_default_timeout() {
        let runtime = builtin_app(Some(Duration::from_secs(1))).unwrap().runtime();
        let result = runtime
            .execute(&envelope("weaver.sleep", json!({"ms": 5_000})))
            .await;
        assert!(matches!(result, Err(WeaverError::HandlerTimeout(_))));
    }
}
