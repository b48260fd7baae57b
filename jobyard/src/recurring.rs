//! Recurring job definitions and schedule evaluation.
//!
//! A definition carries either a cron expression, evaluated in the
//! definition's IANA timezone, or a fixed interval in seconds. Five-field
//! cron expressions are accepted with an implied seconds field of `0`.

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::job::{JobOptions, NewJob};

/// Longest accepted interval: ten years.
pub const MAX_INTERVAL_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize,
    Deserialize,
)]
pub struct RecurringJobId(pub Uuid);

impl Default for RecurringJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl RecurringJobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for RecurringJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parsed form of a definition's schedule columns.
#[derive(Clone, Debug)]
pub enum Schedule {
    Cron { schedule: Box<cron::Schedule>, timezone: Tz },
    Interval { every: Duration },
}

impl Schedule {
    /// First firing strictly after `reference`, in UTC. `None` when no
    /// representable time follows.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { schedule, timezone } => schedule
                .after(&reference.with_timezone(timezone))
                .next()
                .map(|at| at.with_timezone(&Utc)),
            Schedule::Interval { every } => reference.checked_add_signed(*every),
        }
    }
}

/// A template that periodically produces jobs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecurringJob {
    pub id: RecurringJobId,
    pub name: String,
    pub tenant_id: Option<Uuid>,
    pub queue_name: String,
    pub job_type: String,
    pub payload_template: Value,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub timezone: String,
    pub priority: i32,
    pub is_enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RecurringJob {
    pub fn schedule(&self) -> Result<Schedule> {
        match (&self.cron_expression, self.interval_seconds) {
            (Some(expr), None) => Ok(Schedule::Cron {
                schedule: Box::new(parse_cron(expr)?),
                timezone: parse_timezone(&self.timezone)?,
            }),
            (None, Some(seconds)) if (1..=MAX_INTERVAL_SECONDS).contains(&seconds) => {
                let every = Duration::try_seconds(seconds).ok_or_else(|| {
                    JobError::validation(format!("interval {seconds}s is out of range"))
                })?;
                Ok(Schedule::Interval { every })
            }
            (None, Some(seconds)) => Err(JobError::validation(format!(
                "interval must be between 1 and {MAX_INTERVAL_SECONDS} seconds, got {seconds}"
            ))),
            _ => Err(JobError::validation(
                "exactly one of cron expression or interval is required",
            )),
        }
    }

    /// Next time this definition should fire.
    ///
    /// Interval definitions that never ran are due immediately; cron
    /// definitions that never ran count from their creation time.
    pub fn next_run_at(&self) -> Result<Option<DateTime<Utc>>> {
        let schedule = self.schedule()?;
        Ok(match (&schedule, self.last_run_at) {
            (Schedule::Interval { .. }, None) => Some(self.created_at),
            (_, last) => {
                schedule.next_after(last.unwrap_or(self.created_at))
            }
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> Result<bool> {
        if !self.is_enabled {
            return Ok(false);
        }
        Ok(self.next_run_at()?.is_some_and(|at| at <= now))
    }

    /// Materialize one job instance from the template.
    pub fn instantiate(&self) -> NewJob {
        NewJob {
            tenant_id: self.tenant_id,
            queue_name: self.queue_name.clone(),
            job_type: self.job_type.clone(),
            payload: self.payload_template.clone(),
            options: JobOptions::default().with_priority(self.priority),
            recurring_job_id: Some(self.id),
        }
    }
}

/// Operator input for a recurring definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewRecurringJob {
    pub name: String,
    pub tenant_id: Option<Uuid>,
    pub queue_name: String,
    pub job_type: String,
    pub payload_template: Value,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub timezone: Option<String>,
    pub priority: i32,
    pub is_enabled: bool,
}

impl NewRecurringJob {
    pub fn cron(
        name: impl Into<String>,
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        expression: impl Into<String>,
    ) -> Self {
        Self::base(name, queue_name, job_type, Some(expression.into()), None)
    }

    pub fn interval(
        name: impl Into<String>,
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        seconds: i64,
    ) -> Self {
        Self::base(name, queue_name, job_type, None, Some(seconds))
    }

    fn base(
        name: impl Into<String>,
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        cron_expression: Option<String>,
        interval_seconds: Option<i64>,
    ) -> Self {
        Self {
            name: name.into(),
            tenant_id: None,
            queue_name: queue_name.into(),
            job_type: job_type.into(),
            payload_template: Value::Object(Default::default()),
            cron_expression,
            interval_seconds,
            timezone: None,
            priority: 0,
            is_enabled: true,
        }
    }

    /// Set the payload copied into every fired job.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload_template = payload;
        self
    }

    /// Set the IANA timezone cron expressions are evaluated in.
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    /// Set the tenant fired jobs belong to.
    pub fn with_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Set the priority of fired jobs.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Enable or disable scheduled firing.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.is_enabled = enabled;
        self
    }

    /// Validate and build the stored definition.
    pub fn into_recurring(self, now: DateTime<Utc>) -> Result<RecurringJob> {
        if self.name.trim().is_empty() {
            return Err(JobError::validation("recurring job name is required"));
        }
        if self.queue_name.trim().is_empty() || self.job_type.trim().is_empty()
        {
            return Err(JobError::validation(
                "recurring job needs a queue name and a job type",
            ));
        }
        let job = RecurringJob {
            id: RecurringJobId::new(),
            name: self.name,
            tenant_id: self.tenant_id,
            queue_name: self.queue_name,
            job_type: self.job_type,
            payload_template: self.payload_template,
            cron_expression: self.cron_expression.map(|e| e.trim().to_string()),
            interval_seconds: self.interval_seconds,
            timezone: self.timezone.unwrap_or_else(|| "UTC".to_string()),
            priority: self.priority,
            is_enabled: self.is_enabled,
            last_run_at: None,
            created_at: now,
        };
        parse_timezone(&job.timezone)?;
        job.schedule()?;
        Ok(job)
    }
}

/// Parse a cron expression, accepting the classic five-field form.
pub fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let trimmed = expression.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {trimmed}"),
        6 | 7 => trimmed.to_string(),
        n => {
            return Err(JobError::validation(format!(
                "cron expression must have 5 to 7 fields, got {n}"
            )))
        }
    };
    cron::Schedule::from_str(&normalized).map_err(|err| {
        JobError::validation(format!("invalid cron expression {trimmed:?}: {err}"))
    })
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| JobError::validation(format!("unknown timezone {name:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_interval_never_run_is_due() {
        let job = NewRecurringJob::interval("tick", "q", "t", 60)
            .into_recurring(at("2026-03-01T12:00:00Z"))
            .unwrap();
        assert!(job.is_due(at("2026-03-01T12:00:00Z")).unwrap());
    }

    #[test]
    fn test_interval_elapsed() {
        let mut job = NewRecurringJob::interval("tick", "q", "t", 60)
            .into_recurring(at("2026-03-01T11:00:00Z"))
            .unwrap();
        job.last_run_at = Some(at("2026-03-01T11:58:59Z"));
        assert!(job.is_due(at("2026-03-01T12:00:00Z")).unwrap());
        job.last_run_at = Some(at("2026-03-01T12:00:00Z"));
        assert!(!job.is_due(at("2026-03-01T12:00:00Z")).unwrap());
    }

    #[test]
    fn test_disabled_is_never_due() {
        let job = NewRecurringJob::interval("tick", "q", "t", 60)
            .enabled(false)
            .into_recurring(at("2026-03-01T11:00:00Z"))
            .unwrap();
        assert!(!job.is_due(at("2026-03-02T00:00:00Z")).unwrap());
    }

    #[test]
    fn test_five_field_cron() {
        let mut job =
            NewRecurringJob::cron("nightly", "q", "t", "30 2 * * *")
                .into_recurring(at("2026-03-01T00:00:00Z"))
                .unwrap();
        assert_eq!(
            job.next_run_at().unwrap(),
            Some(at("2026-03-01T02:30:00Z"))
        );
        assert!(!job.is_due(at("2026-03-01T02:29:59Z")).unwrap());
        assert!(job.is_due(at("2026-03-01T02:30:00Z")).unwrap());

        job.last_run_at = Some(at("2026-03-01T02:30:00Z"));
        assert!(!job.is_due(at("2026-03-01T12:00:00Z")).unwrap());
        assert!(job.is_due(at("2026-03-02T02:30:00Z")).unwrap());
    }

    #[test]
    fn test_cron_respects_timezone() {
        let job = NewRecurringJob::cron("morning", "q", "t", "0 9 * * *")
            .with_timezone("America/New_York")
            .into_recurring(at("2026-01-15T00:00:00Z"))
            .unwrap();
        // 09:00 EST is 14:00 UTC in January.
        let expected = chrono_tz::America::New_York
            .with_ymd_and_hms(2026, 1, 15, 9, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(job.next_run_at().unwrap(), Some(expected));
        assert_eq!(expected, at("2026-01-15T14:00:00Z"));
    }

    #[test]
    fn test_invalid_definitions_rejected() {
        let now = at("2026-03-01T00:00:00Z");
        assert!(NewRecurringJob::cron("bad", "q", "t", "not a cron")
            .into_recurring(now)
            .is_err());
        assert!(NewRecurringJob::interval("zero", "q", "t", 0)
            .into_recurring(now)
            .is_err());
        assert!(NewRecurringJob::interval("tz", "q", "t", 60)
            .with_timezone("Mars/Olympus")
            .into_recurring(now)
            .is_err());
        assert!(NewRecurringJob::cron("tz", "q", "t", "0 9 * * *")
            .with_timezone("Mars/Olympus")
            .into_recurring(now)
            .is_err());

        let mut both = NewRecurringJob::interval("both", "q", "t", 60);
        both.cron_expression = Some("0 9 * * *".into());
        assert!(both.into_recurring(now).is_err());
    }

    #[test]
    fn test_oversized_interval_rejected() {
        let now = at("2026-03-01T00:00:00Z");
        let err = NewRecurringJob::interval("big", "q", "t", i64::MAX)
            .into_recurring(now)
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));

        NewRecurringJob::interval("decade", "q", "t", MAX_INTERVAL_SECONDS)
            .into_recurring(now)
            .unwrap();
    }

    #[test]
    fn test_interval_past_end_of_time_never_fires() {
        let mut job = NewRecurringJob::interval("late", "q", "t", 60)
            .into_recurring(at("2026-03-01T00:00:00Z"))
            .unwrap();
        job.last_run_at = Some(DateTime::<Utc>::MAX_UTC);
        assert_eq!(job.next_run_at().unwrap(), None);
        assert!(!job.is_due(DateTime::<Utc>::MAX_UTC).unwrap());
    }

    #[test]
    fn test_instantiate_copies_template() {
        let job = NewRecurringJob::interval("digest", "mail", "send_digest", 3600)
            .with_payload(serde_json::json!({"kind": "weekly"}))
            .with_priority(7)
            .into_recurring(at("2026-03-01T00:00:00Z"))
            .unwrap();
        let new_job = job.instantiate();
        assert_eq!(new_job.queue_name, "mail");
        assert_eq!(new_job.job_type, "send_digest");
        assert_eq!(new_job.payload["kind"], "weekly");
        assert_eq!(new_job.options.priority, 7);
        assert_eq!(new_job.recurring_job_id, Some(job.id));
    }
}
