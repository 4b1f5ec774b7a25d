use anyhow::Context;
use clap::{Args, Subcommand};
use tracing::info;
use weaver_core::app::{BrokerReachable, StartupCoordinator};
use weaver_core::domain::{DeadLetterEntry, JobId, QueueName};
use weaver_core::ports::Broker;

use super::DatabaseArgs;

#[derive(Args)]
pub struct DeadLettersCommand {
    #[command(flatten)]
    db: DatabaseArgs,

    #[command(subcommand)]
    command: DeadLettersCommands,
}

#[derive(Subcommand)]
enum DeadLettersCommands {
    /// Print dead-lettered jobs of a queue
    List {
        #[arg(long, default_value = "default")]
        queue: String,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Put a dead-lettered job back on its queue with a fresh retry budget
    Replay {
        /// Job id, with or without the `job-` prefix
        job_id: String,
    },
}

fn render(entry: &DeadLetterEntry) -> String {
    format!(
        "{}\t{}\tdeliveries={}\t{}\t{}",
        entry.envelope.id,
        entry.envelope.handler,
        entry.envelope.delivery_count,
        entry.dead_lettered_at.to_rfc3339(),
        entry.error
    )
}

impl DeadLettersCommand {
    pub async fn execute(self) -> anyhow::Result<()> {
        let backends = self.db.connect()?;
        StartupCoordinator::new(self.db.readiness())
            .wait_ready(&BrokerReachable(backends.broker.clone()))
            .await
            .context("broker not reachable")?;

        match self.command {
            DeadLettersCommands::List { queue, limit } => {
                let entries = backends
                    .broker
                    .dead_letters(&QueueName::new(queue), limit)
                    .await
                    .context("cannot list dead letters")?;
                for entry in &entries {
                    println!("{}", render(entry));
                }
                info!(count = entries.len(), "dead letters listed");
            }
            DeadLettersCommands::Replay { job_id } => {
                let job_id: JobId = job_id
                    .parse()
                    .with_context(|| format!("`{job_id}` is not a job id"))?;
                backends
                    .broker
                    .replay_dead_letter(job_id)
                    .await
                    .with_context(|| format!("cannot replay {job_id}"))?;
                println!("replayed {job_id}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use weaver_core::domain::{JobDefaults, NewJob};

    #[test]
    fn renders_one_line_per_entry() {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut envelope = NewJob::new("default", "weaver.fail", json!({})).into_envelope(
            JobId::generate(),
            at,
            &JobDefaults::default(),
        );
        envelope.delivery_count = 3;
        let line = render(&DeadLetterEntry {
            envelope,
            error: "handler failed: boom".into(),
            dead_lettered_at: at,
        });

        assert!(line.starts_with("job-"));
        assert!(line.contains("weaver.fail\tdeliveries=3\t2024-06-01T12:00:00+00:00"));
        assert!(line.ends_with("handler failed: boom"));
    }
}
