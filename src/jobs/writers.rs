//! Chunk writers for grade changes and coupon grants

use crate::batch::{ItemWriter, WriteMode};
use crate::config::DuplicatePolicy;
use crate::db::Database;
use crate::error::Result;
use crate::membership::{CouponGrant, GradeChange};
use async_trait::async_trait;
use sqlx::SqliteConnection;

/// Updates `members.member_grade_no` by key, one statement per chunk
pub struct GradeWriter;

#[async_trait]
impl ItemWriter for GradeWriter {
    type Item = GradeChange;

    fn mode(&self) -> WriteMode {
        WriteMode::Update
    }

    async fn write(&self, conn: &mut SqliteConnection, chunk: &[GradeChange]) -> Result<u64> {
        Database::update_member_grades(conn, chunk).await
    }
}

/// Inserts `given_coupons` rows, one statement per chunk
pub struct CouponGrantWriter {
    policy: DuplicatePolicy,
}

impl CouponGrantWriter {
    /// Writer with the given handling of already-granted pairs
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl ItemWriter for CouponGrantWriter {
    type Item = CouponGrant;

    fn mode(&self) -> WriteMode {
        WriteMode::Insert
    }

    async fn write(&self, conn: &mut SqliteConnection, chunk: &[CouponGrant]) -> Result<u64> {
        Database::insert_coupon_grants(conn, chunk, self.policy).await
    }
}
