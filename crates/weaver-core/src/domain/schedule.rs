//! Schedule - 定期実行エントリ
//!
//! 状態遷移: Idle → Due → Fired → Idle
//! - next_fire_at は `last_fired_at`（なければ `created_at`）を anchor にして計算する
//! - last_fired_at は due 時刻ではなく tick の `now` に更新する
//! - cron は scheduler の timezone の壁時計で評価する（interval は timezone に依存しない）

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::envelope::{EnqueueOptions, HandlerId, NewJob, QueueName};
use super::time::add_std;
use crate::error::WeaverError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecurrenceError {
    #[error("empty recurrence expression")]
    Empty,

    #[error("invalid interval `{0}`, expected e.g. `every 60s`, `every 30m`")]
    Interval(String),

    #[error("invalid cron expression `{expr}`: {reason}")]
    Cron { expr: String, reason: String },
}

#[derive(Clone)]
enum RecurrenceKind {
    Every(Duration),
    Cron(cron::Schedule),
}

/// Recurrence rule of a schedule entry.
///
/// Accepted forms:
/// - `every 90s`, `every 5m`, `every 2h`, `every 1d`
/// - cron with 5 fields (`*/30 * * * *`, minute precision), 6 or 7 fields
///   (leading seconds, optional year), or aliases such as `@hourly`
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Recurrence {
    expr: String,
    kind: RecurrenceKind,
}

impl Recurrence {
    pub fn parse(expr: &str) -> Result<Self, RecurrenceError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(RecurrenceError::Empty);
        }

        let interval = expr
            .strip_prefix("every ")
            .or_else(|| expr.strip_prefix("@every "));
        if let Some(interval) = interval {
            let every = parse_interval(interval.trim())
                .ok_or_else(|| RecurrenceError::Interval(expr.to_string()))?;
            return Ok(Self {
                expr: expr.to_string(),
                kind: RecurrenceKind::Every(every),
            });
        }

        let normalized = if !expr.starts_with('@') && expr.split_whitespace().count() == 5 {
            format!("0 {expr}")
        } else {
            expr.to_string()
        };
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| RecurrenceError::Cron {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            expr: expr.to_string(),
            kind: RecurrenceKind::Cron(schedule),
        })
    }

    pub fn every(interval: Duration) -> Self {
        Self {
            expr: format!("every {}s", interval.as_secs()),
            kind: RecurrenceKind::Every(interval),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `anchor`, cron fields read as UTC.
    pub fn next_after(&self, anchor: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_after_in(anchor, Tz::UTC)
    }

    /// First fire time strictly after `anchor`, cron fields read as wall-clock
    /// time in `tz`.
    pub fn next_after_in(&self, anchor: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        match &self.kind {
            RecurrenceKind::Every(interval) => Some(add_std(anchor, *interval)),
            RecurrenceKind::Cron(schedule) => schedule
                .after(&anchor.with_timezone(&tz))
                .next()
                .map(|at| at.with_timezone(&Utc)),
        }
    }
}

fn parse_interval(text: &str) -> Option<Duration> {
    let split = text.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = text.split_at(split);
    let n: u64 = digits.parse().ok()?;
    let secs = match unit.trim() {
        "s" | "sec" | "secs" => n,
        "m" | "min" | "mins" => n.checked_mul(60)?,
        "h" | "hour" | "hours" => n.checked_mul(3600)?,
        "d" | "day" | "days" => n.checked_mul(86_400)?,
        _ => return None,
    };
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl fmt::Debug for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Recurrence").field(&self.expr).finish()
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

impl PartialEq for Recurrence {
    fn eq(&self, other: &Self) -> bool {
        self.expr == other.expr
    }
}

impl FromStr for Recurrence {
    type Err = RecurrenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Recurrence {
    type Error = RecurrenceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Recurrence> for String {
    fn from(value: Recurrence) -> Self {
        value.expr
    }
}

/// Per-entry tick state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Idle,
    Due,
    Fired,
}

/// One row of the schedule table. Mutated only by the scheduler tick loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub name: String,
    pub recurrence: Recurrence,
    pub queue: QueueName,
    pub handler: HandlerId,
    /// Payload template copied into every fired job.
    pub payload: serde_json::Value,
    pub max_retries: Option<u32>,
    pub enabled: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduleEntry {
    pub fn new(
        name: impl Into<String>,
        recurrence: Recurrence,
        queue: impl Into<QueueName>,
        handler: impl Into<HandlerId>,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            recurrence,
            queue: queue.into(),
            handler: handler.into(),
            payload,
            max_retries: None,
            enabled: true,
            last_fired_at: None,
            created_at,
        }
    }

    pub fn anchor(&self) -> DateTime<Utc> {
        self.last_fired_at.unwrap_or(self.created_at)
    }

    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.next_fire_at_in(Tz::UTC)
    }

    pub fn next_fire_at_in(&self, tz: Tz) -> Option<DateTime<Utc>> {
        self.recurrence.next_after_in(self.anchor(), tz)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_due_in(now, Tz::UTC)
    }

    pub fn is_due_in(&self, now: DateTime<Utc>, tz: Tz) -> bool {
        self.enabled && self.next_fire_at_in(tz).is_some_and(|at| now >= at)
    }

    /// Job built from the payload template.
    pub fn to_new_job(&self) -> NewJob {
        let mut options = EnqueueOptions::default();
        options.max_retries = self.max_retries;
        NewJob::new(self.queue.clone(), self.handler.clone(), self.payload.clone())
            .with_options(options)
    }

    pub fn validate(&self) -> Result<(), WeaverError> {
        if self.name.trim().is_empty() {
            return Err(WeaverError::validation("schedule name must not be empty"));
        }
        self.to_new_job().validate()
    }
}

/// Static definition of a schedule, as written in a seed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    pub name: String,
    pub recurrence: Recurrence,
    pub queue: QueueName,
    pub handler: HandlerId,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl ScheduleDefinition {
    pub fn into_entry(self, created_at: DateTime<Utc>) -> ScheduleEntry {
        ScheduleEntry {
            name: self.name,
            recurrence: self.recurrence,
            queue: self.queue,
            handler: self.handler,
            payload: self.payload,
            max_retries: self.max_retries,
            enabled: self.enabled,
            last_fired_at: None,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{TimeDelta, TimeZone};
    use rstest::rstest;
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    #[rstest]
    #[case::seconds("every 60s", 60)]
    #[case::minutes("every 5m", 300)]
    #[case::hours("every 2h", 7200)]
    #[case::days("@every 1d", 86_400)]
    fn interval_recurrences(#[case] expr: &str, #[case] secs: i64) {
        let r = Recurrence::parse(expr).unwrap();
        assert_eq!(r.next_after(t0()), Some(t0() + TimeDelta::seconds(secs)));
    }

    #[rstest]
    #[case::zero("every 0s")]
    #[case::unit("every 5 fortnights")]
    #[case::missing("every s")]
    fn bad_intervals_are_rejected(#[case] expr: &str) {
        assert_matches!(Recurrence::parse(expr), Err(RecurrenceError::Interval(_)));
    }

    #[test]
    fn five_field_cron_runs_at_minute_precision() {
        let r = Recurrence::parse("*/30 * * * *").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 10, 0).unwrap();
        assert_eq!(
            r.next_after(at),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap())
        );
    }

    #[test]
    fn six_field_cron_is_accepted_as_is() {
        let r = Recurrence::parse("0 0 * * * *").unwrap();
        assert_eq!(
            r.next_after(t0()),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 13, 0, 0).unwrap())
        );
    }

    #[rstest]
    #[case::utc(Tz::UTC, (9, 0))]
    #[case::tehran(Tz::Asia__Tehran, (5, 30))]
    #[case::new_york(Tz::America__New_York, (13, 0))]
    fn cron_reads_wall_clock_of_the_zone(#[case] tz: Tz, #[case] utc: (u32, u32)) {
        let r = Recurrence::parse("0 9 * * *").unwrap();
        let anchor = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 6, 1, utc.0, utc.1, 0).unwrap();
        assert_eq!(r.next_after_in(anchor, tz), Some(expected));
    }

    #[test]
    fn intervals_ignore_the_zone() {
        let r = Recurrence::parse("every 90s").unwrap();
        assert_eq!(
            r.next_after_in(t0(), Tz::Asia__Tehran),
            Some(t0() + TimeDelta::seconds(90))
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert_matches!(Recurrence::parse("not a schedule"), Err(RecurrenceError::Cron { .. }));
        assert_matches!(Recurrence::parse("   "), Err(RecurrenceError::Empty));
    }

    #[test]
    fn recurrence_serializes_as_its_expression() {
        let r = Recurrence::parse("every 60s").unwrap();
        assert_eq!(serde_json::to_string(&r).unwrap(), "\"every 60s\"");
        let back: Recurrence = serde_json::from_str("\"every 60s\"").unwrap();
        assert_eq!(back, r);
        assert!(serde_json::from_str::<Recurrence>("\"every never\"").is_err());
    }

    #[test]
    fn due_is_anchored_on_last_fired() {
        let mut entry =
            ScheduleEntry::new("beat", Recurrence::every(Duration::from_secs(60)), "q", "h", json!({}), t0());

        assert!(!entry.is_due(t0() + TimeDelta::seconds(59)));
        assert!(entry.is_due(t0() + TimeDelta::seconds(60)));

        entry.last_fired_at = Some(t0() + TimeDelta::seconds(61));
        assert_eq!(entry.next_fire_at(), Some(t0() + TimeDelta::seconds(121)));
        assert!(!entry.is_due(t0() + TimeDelta::seconds(120)));
    }

    #[test]
    fn disabled_entries_are_never_due() {
        let mut entry =
            ScheduleEntry::new("beat", Recurrence::every(Duration::from_secs(1)), "q", "h", json!({}), t0());
        entry.enabled = false;
        assert!(!entry.is_due(t0() + TimeDelta::days(1)));
    }

    #[test]
    fn definition_defaults() {
        let def: ScheduleDefinition = serde_json::from_value(json!({
            "name": "cache_popular_urls",
            "recurrence": "*/30 * * * *",
            "queue": "default",
            "handler": "urlshortener.cache_popular_urls",
        }))
        .unwrap();

        let entry = def.into_entry(t0());
        assert!(entry.enabled);
        assert_eq!(entry.payload, serde_json::Value::Null);
        assert_eq!(entry.last_fired_at, None);
        assert!(entry.validate().is_ok());
    }
}
