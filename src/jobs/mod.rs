//! The membership jobs
//!
//! Each [`JobKind`] has a parameter schema, a typed parameter struct and a factory
//! method that wires its steps from sources, processors and writers:
//!
//! | job                   | steps                                                                 |
//! |-----------------------|-----------------------------------------------------------------------|
//! | `member_grade_job`    | `member_grade_reset`, `member_grade_update`, `gvip_coupon_grant`, `vip_coupon_grant` |
//! | `grade_coupon_job`    | `grade_coupon_grant`                                                  |
//! | `birthday_coupon_job` | `birthday_coupon_grant`                                               |

use crate::batch::{ChunkStep, Job, JobParameters, ParamDef, ParamKind, StepSettings};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, LaunchError, Result};
use crate::membership::{CouponName, Grade, ReferenceLookup};
use chrono::{NaiveDate, TimeZone};
use chrono_tz::Tz;
use std::str::FromStr;
use std::sync::Arc;

pub mod processors;
pub mod sources;
pub mod writers;

use processors::{GrantCouponProcessor, ResetGradeProcessor, UpdateGradeProcessor};
use sources::{AllMembers, MembersByBirthday, MembersByGrade, PaymentsInWindow};
use writers::{CouponGrantWriter, GradeWriter};

const RUN_ID: ParamDef = ParamDef::optional("runId", ParamKind::Long);

/// The jobs this crate can launch
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Monthly: reset grades, recompute them from the purchase window, grant tier coupons
    MemberGrade,
    /// Grant one coupon to every holder of one grade
    GradeCoupon,
    /// Daily: grant the birthday coupon
    BirthdayCoupon,
}

impl JobKind {
    /// Every job kind
    pub const ALL: [JobKind; 3] = [
        JobKind::MemberGrade,
        JobKind::GradeCoupon,
        JobKind::BirthdayCoupon,
    ];

    /// Job name recorded with each instance
    pub fn name(self) -> &'static str {
        match self {
            JobKind::MemberGrade => "member_grade_job",
            JobKind::GradeCoupon => "grade_coupon_job",
            JobKind::BirthdayCoupon => "birthday_coupon_job",
        }
    }

    /// Launch parameter schema
    ///
    /// Every job also takes an optional numeric `runId`; a new value starts a new job
    /// instance with otherwise identical parameters.
    pub fn schema(self) -> &'static [ParamDef] {
        const GRADE: &[ParamDef] = &[
            ParamDef::required("startDate", ParamKind::Date),
            ParamDef::required("endDate", ParamKind::Date),
            RUN_ID,
        ];
        const GRADE_COUPON: &[ParamDef] = &[
            ParamDef::required("gradeNo", ParamKind::Long),
            ParamDef::required("couponName", ParamKind::String),
            RUN_ID,
        ];
        const BIRTHDAY: &[ParamDef] = &[ParamDef::required("runDate", ParamKind::Date), RUN_ID];

        match self {
            JobKind::MemberGrade => GRADE,
            JobKind::GradeCoupon => GRADE_COUPON,
            JobKind::BirthdayCoupon => BIRTHDAY,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobKind {
    type Err = LaunchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| LaunchError::InvalidParameter {
                name: "job".to_string(),
                value: s.to_string(),
                reason: "unknown job".to_string(),
            })
    }
}

/// Parameters of `member_grade_job`: orders in `[start_date, end_date)` count
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GradeJobParameters {
    /// First day of the window (inclusive)
    pub start_date: NaiveDate,
    /// Day after the window (exclusive)
    pub end_date: NaiveDate,
}

impl GradeJobParameters {
    /// Read from bound parameters
    pub fn from_params(params: &JobParameters) -> std::result::Result<Self, LaunchError> {
        let start_date = params.date("startDate")?;
        let end_date = params.date("endDate")?;
        if start_date >= end_date {
            return Err(LaunchError::InvalidParameter {
                name: "endDate".to_string(),
                value: end_date.to_string(),
                reason: format!("must be after startDate {start_date}"),
            });
        }
        Ok(Self {
            start_date,
            end_date,
        })
    }

    /// Render as launch parameters
    pub fn to_params(self) -> JobParameters {
        JobParameters::new()
            .with_date("startDate", self.start_date)
            .with_date("endDate", self.end_date)
    }
}

/// Parameters of `grade_coupon_job`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GradeCouponParameters {
    /// Grade whose holders receive the coupon
    pub grade: Grade,
    /// Coupon to grant
    pub coupon: CouponName,
}

impl GradeCouponParameters {
    /// Read from bound parameters
    pub fn from_params(params: &JobParameters) -> std::result::Result<Self, LaunchError> {
        let grade_no = params.long("gradeNo")?;
        let grade = Grade::from_id(grade_no).ok_or_else(|| LaunchError::InvalidParameter {
            name: "gradeNo".to_string(),
            value: grade_no.to_string(),
            reason: "unknown grade".to_string(),
        })?;
        let coupon = params.string("couponName")?.parse()?;
        Ok(Self { grade, coupon })
    }

    /// Render as launch parameters
    pub fn to_params(self) -> JobParameters {
        JobParameters::new()
            .with_long("gradeNo", self.grade.id())
            .with_string("couponName", self.coupon.as_str())
    }
}

/// Parameters of `birthday_coupon_job`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BirthdayJobParameters {
    /// Day whose birthdays are served
    pub run_date: NaiveDate,
}

impl BirthdayJobParameters {
    /// Read from bound parameters
    pub fn from_params(params: &JobParameters) -> std::result::Result<Self, LaunchError> {
        Ok(Self {
            run_date: params.date("runDate")?,
        })
    }

    /// Render as launch parameters
    pub fn to_params(self) -> JobParameters {
        JobParameters::new().with_date("runDate", self.run_date)
    }
}

/// Builds jobs from launch parameters
#[derive(Clone)]
pub struct JobFactory {
    db: Arc<Database>,
    config: Arc<Config>,
}

impl JobFactory {
    /// Factory over a database and configuration
    pub fn new(db: Arc<Database>, config: Arc<Config>) -> Self {
        Self { db, config }
    }

    /// Build the job of `kind` for already-bound parameters
    pub fn build(&self, kind: JobKind, params: &JobParameters) -> Result<Job> {
        match kind {
            JobKind::MemberGrade => self.member_grade_job(GradeJobParameters::from_params(params)?),
            JobKind::GradeCoupon => {
                self.grade_coupon_job(GradeCouponParameters::from_params(params)?)
            }
            JobKind::BirthdayCoupon => {
                self.birthday_coupon_job(BirthdayJobParameters::from_params(params)?)
            }
        }
    }

    /// Reset, recompute and reward member grades
    pub fn member_grade_job(&self, params: GradeJobParameters) -> Result<Job> {
        let tz = self.config.schedule.timezone()?;
        let start = local_midnight(params.start_date, tz)?;
        let end = local_midnight(params.end_date, tz)?;
        let steps = &self.config.steps;

        let reset = ChunkStep::new(
            StepSettings::from_config("member_grade_reset", &steps.reset_grade),
            AllMembers::new(self.db.clone()),
            ResetGradeProcessor::new(self.lookup()),
            GradeWriter,
        );

        let update = ChunkStep::new(
            StepSettings::from_config("member_grade_update", &steps.update_grade)
                .restart_with_upstream(),
            PaymentsInWindow::new(self.db.clone(), start, end),
            UpdateGradeProcessor::new(self.lookup(), self.config.tiers),
            GradeWriter,
        );

        Job::builder(JobKind::MemberGrade.name())
            .step(reset)
            .step(update)
            .step(self.grant_step("gvip_coupon_grant", Grade::Gvip, CouponName::Gvip))
            .step(self.grant_step("vip_coupon_grant", Grade::Vip, CouponName::Vip))
            .build()
    }

    /// Grant a coupon to the holders of one grade
    pub fn grade_coupon_job(&self, params: GradeCouponParameters) -> Result<Job> {
        Job::builder(JobKind::GradeCoupon.name())
            .step(self.grant_step("grade_coupon_grant", params.grade, params.coupon))
            .build()
    }

    /// Grant the birthday coupon to members born on the run date's month and day
    pub fn birthday_coupon_job(&self, params: BirthdayJobParameters) -> Result<Job> {
        let step = ChunkStep::new(
            StepSettings::from_config("birthday_coupon_grant", &self.config.steps.birthday_coupon),
            MembersByBirthday::new(self.db.clone(), params.run_date),
            GrantCouponProcessor::new(self.lookup(), CouponName::Birthday),
            CouponGrantWriter::new(self.config.grants.duplicate_policy),
        );

        Job::builder(JobKind::BirthdayCoupon.name())
            .step(step)
            .build()
    }

    fn grant_step(
        &self,
        name: &str,
        grade: Grade,
        coupon: CouponName,
    ) -> ChunkStep<MembersByGrade, GrantCouponProcessor, CouponGrantWriter> {
        ChunkStep::new(
            StepSettings::from_config(name, &self.config.steps.grade_coupon),
            MembersByGrade::new(self.db.clone(), grade),
            GrantCouponProcessor::new(self.lookup(), coupon).for_grade(grade),
            CouponGrantWriter::new(self.config.grants.duplicate_policy),
        )
    }

    fn lookup(&self) -> Arc<dyn ReferenceLookup> {
        self.db.clone()
    }
}

/// Unix seconds of midnight at the start of `date` in `tz`
pub fn local_midnight(date: NaiveDate, tz: Tz) -> Result<i64> {
    date.and_hms_opt(0, 0, 0)
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        .map(|local| local.timestamp())
        .ok_or_else(|| Error::Config {
            message: format!("midnight of {date} does not exist in {tz}"),
            key: Some("schedule.timezone".to_string()),
        })
}
