//! Cron triggers for the scheduled jobs.
//!
//! Two triggers are derived from [`ScheduleConfig`]: the daily birthday coupon job and
//! the monthly grade job. Expressions are evaluated in the configured IANA zone, and
//! each fire time determines the launch parameters of its job:
//!
//! - `birthday_coupon_job`: `runDate` is the local date of the fire time
//! - `member_grade_job`: the previous calendar month, `startDate` = its first day,
//!   `endDate` = the first day of the fire time's month
//!
//! # Example
//!
//! ```rust
//! use grade_batch::config::ScheduleConfig;
//! use grade_batch::scheduler::Scheduler;
//!
//! let scheduler = Scheduler::from_config(&ScheduleConfig::default()).unwrap();
//! let (fire, trigger) = scheduler.next_fire(chrono::Utc::now()).unwrap();
//! println!("{} fires at {}", trigger.kind(), fire);
//! ```

use crate::batch::JobParameters;
use crate::config::ScheduleConfig;
use crate::error::{Error, Result};
use crate::jobs::{BirthdayJobParameters, GradeJobParameters, JobKind};
use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

/// One job bound to a cron expression
#[derive(Clone, Debug)]
pub struct Trigger {
    kind: JobKind,
    expression: String,
    schedule: Schedule,
}

impl Trigger {
    /// Parse a six-field cron expression (seconds first) for `kind`
    pub fn new(kind: JobKind, expression: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expression).map_err(|e| Error::Config {
            message: format!("invalid cron expression '{expression}' for {kind}: {e}"),
            key: None,
        })?;
        Ok(Self {
            kind,
            expression: expression.to_string(),
            schedule,
        })
    }

    /// Job launched by this trigger
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Cron expression as configured
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }

    /// Launch parameters for a fire at `fire`
    pub fn params_for(&self, fire: &DateTime<Tz>) -> Result<JobParameters> {
        let date = fire.date_naive();
        match self.kind {
            JobKind::BirthdayCoupon => Ok(BirthdayJobParameters { run_date: date }.to_params()),
            JobKind::MemberGrade => {
                let (start_date, end_date) = previous_month(date)?;
                Ok(GradeJobParameters {
                    start_date,
                    end_date,
                }
                .to_params())
            }
            JobKind::GradeCoupon => Err(Error::Config {
                message: format!("{} has no scheduled parameters", self.kind),
                key: None,
            }),
        }
    }
}

/// The configured triggers and their zone
#[derive(Clone, Debug)]
pub struct Scheduler {
    timezone: Tz,
    triggers: Vec<Trigger>,
}

impl Scheduler {
    /// Build the birthday and grade triggers from configuration
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        Ok(Self {
            timezone: config.timezone()?,
            triggers: vec![
                Trigger::new(JobKind::BirthdayCoupon, &config.birthday_cron)?,
                Trigger::new(JobKind::MemberGrade, &config.grade_cron)?,
            ],
        })
    }

    /// Zone the expressions are evaluated in
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// All triggers
    pub fn triggers(&self) -> &[Trigger] {
        &self.triggers
    }

    /// Earliest fire time after `after` across all triggers
    ///
    /// When two triggers fire at the same instant the one configured first wins; the
    /// other is returned by the next call with the same `after`.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Option<(DateTime<Tz>, &Trigger)> {
        let local = after.with_timezone(&self.timezone);
        self.triggers
            .iter()
            .filter_map(|trigger| trigger.next_after(&local).map(|fire| (fire, trigger)))
            .min_by_key(|(fire, _)| *fire)
    }

    /// Every trigger firing at exactly the earliest instant after `after`
    pub fn due_after(&self, after: DateTime<Utc>) -> Option<(DateTime<Tz>, Vec<&Trigger>)> {
        let (fire, _) = self.next_fire(after)?;
        let local = after.with_timezone(&self.timezone);
        let due = self
            .triggers
            .iter()
            .filter(|trigger| trigger.next_after(&local) == Some(fire))
            .collect();
        Some((fire, due))
    }
}

/// First day of the month before `date`'s month, and first day of `date`'s month
fn previous_month(date: NaiveDate) -> Result<(NaiveDate, NaiveDate)> {
    let end = NaiveDate::from_ymd_opt(date.year(), date.month(), 1);
    let start = end.and_then(|end| end.checked_sub_months(Months::new(1)));
    match (start, end) {
        (Some(start), Some(end)) => Ok((start, end)),
        _ => Err(Error::Config {
            message: format!("no previous month for {date}"),
            key: None,
        }),
    }
}
