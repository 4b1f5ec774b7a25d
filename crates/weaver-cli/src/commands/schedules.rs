use anyhow::Context;
use chrono_tz::Tz;
use clap::{Args, Subcommand};
use weaver_core::app::{PeriodicScheduler, Role};
use weaver_core::domain::{EntryState, ScheduleEntry};
use weaver_core::ports::ScheduleStore;

use super::{DatabaseArgs, parse_timezone};

#[derive(Args)]
pub struct SchedulesCommand {
    #[command(flatten)]
    db: DatabaseArgs,

    /// IANA zone cron expressions are read in
    #[arg(long, env = "WEAVER_TIMEZONE", default_value = "UTC", value_parser = parse_timezone)]
    timezone: Tz,

    #[command(subcommand)]
    command: SchedulesCommands,
}

#[derive(Subcommand)]
enum SchedulesCommands {
    /// Print the schedule table with each entry's next fire time
    List,
}

fn render(entry: &ScheduleEntry, state: EntryState, tz: Tz) -> String {
    let next = entry
        .next_fire_at_in(tz)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    let last = entry
        .last_fired_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    format!(
        "{}\t{}\t{}/{}\t{:?}\tlast={}\tnext={}",
        entry.name,
        entry.recurrence.as_str(),
        entry.queue,
        entry.handler,
        state,
        last,
        next
    )
}

impl SchedulesCommand {
    pub async fn execute(self) -> anyhow::Result<()> {
        let backends = self.db.connect()?;
        self.db
            .plan(Role::Producer, &backends)
            .wait()
            .await
            .context("datastore not ready")?;

        match self.command {
            SchedulesCommands::List => {
                let entries = backends
                    .datastore
                    .load_schedules()
                    .await
                    .context("cannot load schedules")?;
                let now = chrono::Utc::now();
                for entry in &entries {
                    let state = PeriodicScheduler::entry_state(entry, now, self.timezone);
                    println!("{}", render(entry, state, self.timezone));
                }
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
    use std::time::Duration;
    use weaver_core::domain::Recurrence;

    #[test]
    fn renders_next_fire_time() {
        let created = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let entry = ScheduleEntry::new(
            "heartbeat",
            Recurrence::every(Duration::from_secs(60)),
            "default",
            "weaver.echo",
            json!({}),
            created,
        );
        let line = render(&entry, EntryState::Idle, Tz::UTC);
        assert_eq!(
            line,
            "heartbeat\tevery 60s\tdefault/weaver.echo\tIdle\tlast=never\tnext=2024-06-01T00:01:00+00:00"
        );
    }

    #[test]
    fn cron_next_fire_follows_the_zone() {
        let created = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let entry = ScheduleEntry::new(
            "morning",
            Recurrence::parse("0 9 * * *").unwrap(),
            "default",
            "weaver.echo",
            json!({}),
            created,
        );
        let line = render(&entry, EntryState::Idle, Tz::Asia__Tehran);
        assert!(line.ends_with("next=2024-06-01T05:30:00+00:00"), "{line}");
    }
}
