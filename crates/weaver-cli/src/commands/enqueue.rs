use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Args;
use weaver_core::app::{Producer, Role};
use weaver_core::domain::{EnqueueOptions, NewJob};
use weaver_core::ports::TracingEventSink;

use super::DatabaseArgs;

#[derive(Args)]
pub struct EnqueueCommand {
    #[command(flatten)]
    db: DatabaseArgs,

    #[arg(long, default_value = "default")]
    queue: String,

    /// Handler id, e.g. `weaver.echo`
    #[arg(long)]
    handler: String,

    /// JSON payload
    #[arg(long, default_value = "{}")]
    payload: String,

    /// Make the job visible only after this many seconds
    #[arg(long)]
    delay_secs: Option<u64>,

    #[arg(long)]
    max_retries: Option<u32>,

    /// Per-job handler deadline in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

impl EnqueueCommand {
    fn new_job(&self) -> anyhow::Result<NewJob> {
        let payload: serde_json::Value =
            serde_json::from_str(&self.payload).context("--payload is not valid JSON")?;

        let mut options = EnqueueOptions::default();
        if let Some(secs) = self.delay_secs {
            options = options.with_delay(Duration::from_secs(secs));
        }
        if let Some(max_retries) = self.max_retries {
            options = options.with_max_retries(max_retries);
        }
        if let Some(secs) = self.timeout_secs {
            options = options.with_timeout(Duration::from_secs(secs));
        }
        Ok(NewJob::new(self.queue.as_str(), self.handler.as_str(), payload).with_options(options))
    }

    pub async fn execute(self) -> anyhow::Result<()> {
        let job = self.new_job()?;
        job.validate().context("job rejected")?;

        let backends = self.db.connect()?;
        self.db
            .plan(Role::Producer, &backends)
            .wait()
            .await
            .context("datastore not ready")?;

        let producer = Producer::new(backends.broker).with_events(Arc::new(TracingEventSink));
        let job_id = producer.enqueue(job).await.context("enqueue failed")?;
        println!("{job_id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        cmd: EnqueueCommand,
    }

    #[test]
    fn builds_job_from_flags() {
        let harness = Harness::try_parse_from([
            "enqueue",
            "--database-url",
            "postgres://localhost/weaver",
            "--queue",
            "clicks",
            "--handler",
            "urlshortener.log_click",
            "--payload",
            r#"{"original_url": "https://example.com"}"#,
            "--delay-secs",
            "30",
            "--max-retries",
            "5",
        ])
        .unwrap();

        let job = harness.cmd.new_job().unwrap();
        assert_eq!(job.queue.as_str(), "clicks");
        assert_eq!(job.payload["original_url"], "https://example.com");
        assert_eq!(job.options.delay, Some(Duration::from_secs(30)));
        assert_eq!(job.options.max_retries, Some(5));
        assert_eq!(job.options.timeout, None);
    }

    #[test]
    fn rejects_invalid_payload() {
        let harness = Harness::try_parse_from([
            "enqueue",
            "--database-url",
            "postgres://localhost/weaver",
            "--handler",
            "weaver.echo",
            "--payload",
            "{not json",
        ])
        .unwrap();
        assert!(harness.cmd.new_job().is_err());
    }
}
