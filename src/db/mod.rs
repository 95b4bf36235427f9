//! Database layer for grade-batch
//!
//! Handles SQLite persistence for the membership tables and the batch execution
//! metadata that makes jobs restartable.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`]: Database lifecycle, schema migrations
//! - [`executions`]: Job instances, job executions and step progress
//! - [`members`]: Member, order and coupon rows plus the paged reads the steps use
//! - [`grants`]: Chunk writes: grade updates and coupon grants
//! - [`lookup`]: [`ReferenceLookup`](crate::membership::ReferenceLookup) implementation

use crate::types::{
    BatchStatus, JobExecutionId, JobInstanceId, StepExecution, StepExecutionId,
};
use chrono::NaiveDate;
use sqlx::{FromRow, sqlite::SqlitePool};

mod executions;
mod grants;
mod lookup;
mod members;
mod migrations;

pub use executions::ChunkProgress;

/// New member to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewMember {
    /// External identifier (unique)
    pub uuid: String,
    /// Current grade key
    pub member_grade_no: i64,
    /// Free-form gender code
    pub gender: Option<String>,
    /// Date of birth
    pub birth_date: Option<NaiveDate>,
}

/// Member record from database
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Member {
    /// Unique database ID
    pub member_no: i64,
    /// Current grade key
    pub member_grade_no: i64,
    /// External identifier
    pub uuid: String,
    /// Free-form gender code
    pub gender: Option<String>,
    /// Date of birth
    pub birth_date: Option<NaiveDate>,
    /// Unix timestamp when the member was created
    pub created_at: i64,
    /// Unix timestamp of the last change
    pub updated_at: i64,
    /// Unix timestamp of withdrawal, if withdrawn
    pub deleted_at: Option<i64>,
}

/// Grade record from database
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct MemberGrade {
    /// Grade key
    pub member_grade_no: i64,
    /// Grade name (GVIP, VIP, MEMBER)
    pub grade: String,
}

/// New coupon to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewCoupon {
    /// Display name used for lookup, e.g. "GVIP Coupon"
    pub name: String,
    /// Coupon kind
    pub coupon_type: String,
    /// Days the coupon stays valid after it is given
    pub expired_date: i64,
    /// Minimum order amount the coupon applies to
    pub minimum_money: i64,
    /// Discount granted
    pub discount_amount: f64,
}

/// Coupon record from database
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct Coupon {
    /// Unique database ID
    pub coupon_no: i64,
    /// Display name
    pub name: String,
    /// Coupon kind
    pub coupon_type: String,
    /// Days the coupon stays valid after it is given
    pub expired_date: i64,
    /// Minimum order amount the coupon applies to
    pub minimum_money: i64,
    /// Discount granted
    pub discount_amount: f64,
}

/// New order to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewOrder {
    /// Ordering member
    pub member_no: i64,
    /// Order total
    pub total_amount: i64,
    /// Unix timestamp of the order
    pub created_at: i64,
}

/// Coupon grant record from database
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct GivenCoupon {
    /// Granted coupon
    pub coupon_no: i64,
    /// Receiving member
    pub member_no: i64,
    /// Unix timestamp of the grant
    pub created_at: i64,
}

/// Job execution record from database
#[derive(Debug, Clone, FromRow)]
pub struct JobExecutionRow {
    /// Unique database ID
    pub id: i64,
    /// Owning job instance
    pub job_instance_id: i64,
    /// Job name (joined from the instance)
    pub job_name: String,
    /// Status code (see [`BatchStatus::to_i32`])
    pub status: i32,
    /// Launch parameters as JSON
    pub parameters: String,
    /// Unix timestamp when the execution was created
    pub started_at: i64,
    /// Unix timestamp when the execution reached a terminal status
    pub ended_at: Option<i64>,
    /// Failure description
    pub exit_message: Option<String>,
}

impl JobExecutionRow {
    /// Typed status
    pub fn status(&self) -> BatchStatus {
        BatchStatus::from_i32(self.status)
    }

    /// Typed ID
    pub fn execution_id(&self) -> JobExecutionId {
        JobExecutionId(self.id)
    }

    /// Typed instance ID
    pub fn instance_id(&self) -> JobInstanceId {
        JobInstanceId(self.job_instance_id)
    }
}

/// Step execution record from database
#[derive(Debug, Clone, FromRow)]
pub struct StepExecutionRow {
    /// Unique database ID
    pub id: i64,
    /// Owning job execution
    pub job_execution_id: i64,
    /// Step name
    pub step_name: String,
    /// Status code (see [`BatchStatus::to_i32`])
    pub status: i32,
    /// Records skipped at open
    pub start_offset: i64,
    /// Records read in committed chunks
    pub read_count: i64,
    /// Records written in committed chunks
    pub write_count: i64,
    /// Records filtered by the processor
    pub filter_count: i64,
    /// Records skipped after tolerated errors
    pub skip_count: i64,
    /// Committed chunks
    pub commit_count: i64,
    /// Rolled back chunks
    pub rollback_count: i64,
    /// Unix timestamp when the step started
    pub started_at: i64,
    /// Unix timestamp when the step ended
    pub ended_at: Option<i64>,
    /// Failure description
    pub exit_message: Option<String>,
}

impl StepExecutionRow {
    /// Typed status
    pub fn status(&self) -> BatchStatus {
        BatchStatus::from_i32(self.status)
    }

    /// Offset a follow-up execution of this step starts from
    pub fn resume_offset(&self) -> u64 {
        (self.start_offset + self.read_count) as u64
    }
}

impl From<StepExecutionRow> for StepExecution {
    fn from(row: StepExecutionRow) -> Self {
        StepExecution {
            id: StepExecutionId(row.id),
            status: BatchStatus::from_i32(row.status),
            step_name: row.step_name,
            start_offset: row.start_offset as u64,
            read_count: row.read_count as u64,
            write_count: row.write_count as u64,
            filter_count: row.filter_count as u64,
            skip_count: row.skip_count as u64,
            commit_count: row.commit_count as u64,
            rollback_count: row.rollback_count as u64,
            exit_message: row.exit_message,
        }
    }
}

/// Database handle for grade-batch
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
