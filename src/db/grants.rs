//! Chunk writes: one bulk statement per chunk on the chunk transaction's connection.
//!
//! Chunk sizes are capped by [`MAX_CHUNK_SIZE`](crate::config::MAX_CHUNK_SIZE), which
//! keeps every statement under SQLite's bind variable limit (32766 in the bundled build).

use crate::config::DuplicatePolicy;
use crate::error::DatabaseError;
use crate::membership::{CouponGrant, GradeChange};
use crate::{Error, Result};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::Database;

impl Database {
    /// Apply a chunk of grade changes with a single `CASE` update
    ///
    /// Fails with [`DatabaseError::NotFound`] if any member in the chunk does not exist,
    /// which rolls back the whole chunk.
    pub async fn update_member_grades(
        conn: &mut SqliteConnection,
        changes: &[GradeChange],
    ) -> Result<u64> {
        if changes.is_empty() {
            return Ok(0);
        }

        let mut query_builder =
            QueryBuilder::<Sqlite>::new("UPDATE members SET member_grade_no = CASE member_no");
        for change in changes {
            query_builder
                .push(" WHEN ")
                .push_bind(change.member_no)
                .push(" THEN ")
                .push_bind(change.grade.id());
        }
        query_builder
            .push(" END, updated_at = ")
            .push_bind(chrono::Utc::now().timestamp())
            .push(" WHERE member_no IN (");
        let mut members = query_builder.separated(", ");
        for change in changes {
            members.push_bind(change.member_no);
        }
        members.push_unseparated(")");

        let result = query_builder
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| Error::from_write(e, "Failed to update member grades"))?;

        let expected = changes.len() as u64;
        if result.rows_affected() != expected {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "grade update matched {} of {} members",
                result.rows_affected(),
                expected
            ))));
        }

        Ok(result.rows_affected())
    }

    /// Insert a chunk of coupon grants with a single multi-row insert
    ///
    /// With [`DuplicatePolicy::Fail`] an existing `(coupon_no, member_no)` pair surfaces
    /// as [`Error::WriteConflict`]; with [`DuplicatePolicy::Ignore`] it is left untouched
    /// and not counted.
    pub async fn insert_coupon_grants(
        conn: &mut SqliteConnection,
        grants: &[CouponGrant],
        policy: DuplicatePolicy,
    ) -> Result<u64> {
        if grants.is_empty() {
            return Ok(0);
        }

        let verb = match policy {
            DuplicatePolicy::Fail => "INSERT INTO",
            DuplicatePolicy::Ignore => "INSERT OR IGNORE INTO",
        };
        let now = chrono::Utc::now().timestamp();

        let mut query_builder = QueryBuilder::<Sqlite>::new(format!(
            "{verb} given_coupons (coupon_no, member_no, created_at) "
        ));
        query_builder.push_values(grants, |mut b, grant| {
            b.push_bind(grant.coupon_no)
                .push_bind(grant.member_no)
                .push_bind(now);
        });

        let result = query_builder
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| Error::from_write(e, "Failed to insert coupon grants"))?;

        Ok(result.rows_affected())
    }
}
