//! Configuration types for grade-batch

use crate::error::{Error, Result};
use crate::membership::Grade;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for a step's chunk size; keeps bulk statements under SQLite's bind limit
pub const MAX_CHUNK_SIZE: usize = 5000;

/// Main configuration for the batch service
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database location
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Retry behaviour for transient chunk commit failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Chunk and page sizes per step
    #[serde(default)]
    pub steps: StepsConfig,

    /// Purchase thresholds for tier assignment
    #[serde(default)]
    pub tiers: TierPolicy,

    /// Coupon grant behaviour
    #[serde(default)]
    pub grants: GrantConfig,

    /// Cron triggers
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Job launch policy
    #[serde(default)]
    pub jobs: JobsConfig,
}

impl Config {
    /// Load a configuration from a JSON file
    ///
    /// Missing sections fall back to their defaults. The result is validated.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.steps.reset_grade.validate("steps.reset_grade")?;
        self.steps.update_grade.validate("steps.update_grade")?;
        self.steps.grade_coupon.validate("steps.grade_coupon")?;
        self.steps.birthday_coupon.validate("steps.birthday_coupon")?;
        self.tiers.validate()?;
        self.schedule.timezone()?;
        self.schedule.validate_expressions()?;

        if self.retry.backoff_multiplier < 1.0 {
            return Err(config_error(
                "backoff multiplier must be at least 1.0",
                "retry.backoff_multiplier",
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(config_error(
                "initial delay must not exceed max delay",
                "retry.initial_delay",
            ));
        }

        Ok(())
    }
}

fn config_error(message: impl Into<String>, key: &str) -> Error {
    Error::Config {
        message: message.into(),
        key: Some(key.to_string()),
    }
}

/// Database location
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database file (created if missing)
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(with = "duration_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(with = "duration_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Sizing and restart policy for one chunk step
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    /// Processed records committed per transaction
    pub chunk_size: usize,

    /// Records fetched per page round-trip (defaults to `chunk_size`)
    #[serde(default)]
    pub page_size: Option<usize>,

    /// Re-run the step even when its last execution completed (default: true)
    #[serde(default = "default_true")]
    pub allow_restart_if_complete: bool,

    /// Processing errors tolerated before the step fails (default: 0, fail fast)
    #[serde(default)]
    pub skip_limit: u64,
}

impl StepConfig {
    /// Step configuration with the given chunk size and defaults otherwise
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            page_size: None,
            allow_restart_if_complete: true,
            skip_limit: 0,
        }
    }

    /// Effective page size
    pub fn page_size(&self) -> usize {
        self.page_size.unwrap_or(self.chunk_size)
    }

    fn validate(&self, key: &str) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(config_error(
                format!("chunk size must be between 1 and {MAX_CHUNK_SIZE}"),
                &format!("{key}.chunk_size"),
            ));
        }
        if self.page_size == Some(0) {
            return Err(config_error(
                "page size must be at least 1",
                &format!("{key}.page_size"),
            ));
        }
        Ok(())
    }
}

/// Per-step configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepsConfig {
    /// Reset of every member to the base grade (default chunk: 1000)
    #[serde(default = "default_reset_grade_step")]
    pub reset_grade: StepConfig,

    /// Grade assignment from purchase totals (default chunk: 5)
    #[serde(default = "default_update_grade_step")]
    pub update_grade: StepConfig,

    /// Grade coupon issuance (default chunk: 100)
    #[serde(default = "default_coupon_step")]
    pub grade_coupon: StepConfig,

    /// Birthday coupon issuance (default chunk: 100)
    #[serde(default = "default_coupon_step")]
    pub birthday_coupon: StepConfig,
}

impl Default for StepsConfig {
    fn default() -> Self {
        Self {
            reset_grade: default_reset_grade_step(),
            update_grade: default_update_grade_step(),
            grade_coupon: default_coupon_step(),
            birthday_coupon: default_coupon_step(),
        }
    }
}

/// Purchase thresholds for tier assignment
///
/// Totals below `vip_threshold` stay `MEMBER`, totals below `gvip_threshold` become
/// `VIP`, everything else is `GVIP`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    /// Lowest total that earns VIP (default: 300,000)
    #[serde(default = "default_vip_threshold")]
    pub vip_threshold: i64,

    /// Lowest total that earns GVIP (default: 500,000)
    #[serde(default = "default_gvip_threshold")]
    pub gvip_threshold: i64,
}

impl TierPolicy {
    /// Grade earned by a purchase total
    pub fn tier_for(&self, total_amount: i64) -> Grade {
        if total_amount >= self.gvip_threshold {
            Grade::Gvip
        } else if total_amount >= self.vip_threshold {
            Grade::Vip
        } else {
            Grade::Member
        }
    }

    fn validate(&self) -> Result<()> {
        if self.vip_threshold <= 0 || self.vip_threshold >= self.gvip_threshold {
            return Err(config_error(
                "vip threshold must be positive and below the gvip threshold",
                "tiers.vip_threshold",
            ));
        }
        Ok(())
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            vip_threshold: default_vip_threshold(),
            gvip_threshold: default_gvip_threshold(),
        }
    }
}

/// What to do when a member already holds the coupon being granted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Fail the chunk with a write conflict
    #[default]
    Fail,
    /// Keep the existing grant and continue
    Ignore,
}

/// Coupon grant behaviour
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GrantConfig {
    /// Handling of `(coupon, member)` pairs that were already granted
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicy,
}

/// Cron triggers for the scheduled jobs
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Run triggers when the scheduler is spawned (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// IANA zone the cron expressions are evaluated in (default: Asia/Seoul)
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Birthday coupon trigger, six-field cron with seconds (default: daily at midnight)
    #[serde(default = "default_birthday_cron")]
    pub birthday_cron: String,

    /// Grade job trigger (default: midnight on the first day of each month)
    #[serde(default = "default_grade_cron")]
    pub grade_cron: String,
}

impl ScheduleConfig {
    /// Parsed timezone
    pub fn timezone(&self) -> Result<Tz> {
        Tz::from_str(&self.timezone).map_err(|e| {
            config_error(
                format!("unknown timezone '{}': {}", self.timezone, e),
                "schedule.timezone",
            )
        })
    }

    fn validate_expressions(&self) -> Result<()> {
        for (key, expression) in [
            ("schedule.birthday_cron", &self.birthday_cron),
            ("schedule.grade_cron", &self.grade_cron),
        ] {
            cron::Schedule::from_str(expression).map_err(|e| {
                config_error(format!("invalid cron expression '{expression}': {e}"), key)
            })?;
        }
        Ok(())
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: default_timezone(),
            birthday_cron: default_birthday_cron(),
            grade_cron: default_grade_cron(),
        }
    }
}

/// Job launch policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Refuse to launch an instance whose last execution completed (default: false)
    #[serde(default)]
    pub prevent_completed_rerun: bool,

    /// How long shutdown waits for running jobs (default: 30 seconds)
    #[serde(with = "duration_serde", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            prevent_completed_rerun: false,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("./grade-batch.db")
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_reset_grade_step() -> StepConfig {
    StepConfig::with_chunk_size(1000)
}

fn default_update_grade_step() -> StepConfig {
    StepConfig::with_chunk_size(5)
}

fn default_coupon_step() -> StepConfig {
    StepConfig::with_chunk_size(100)
}

fn default_vip_threshold() -> i64 {
    300_000
}

fn default_gvip_threshold() -> i64 {
    500_000
}

fn default_timezone() -> String {
    "Asia/Seoul".to_string()
}

fn default_birthday_cron() -> String {
    "0 0 0 * * *".to_string()
}

fn default_grade_cron() -> String {
    "0 0 0 1 * *".to_string()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
