//! Member, order and coupon rows, and the keyset page reads the jobs consume.

use crate::batch::PageRequest;
use crate::error::DatabaseError;
use crate::membership::MemberPayment;
use crate::{Error, Result};

use super::{Coupon, Database, GivenCoupon, Member, NewCoupon, NewMember, NewOrder};

const MEMBER_COLUMNS: &str = r#"
    member_no, member_grade_no, uuid, gender, birth_date, created_at, updated_at, deleted_at
"#;

impl Database {
    /// Insert a new member
    pub async fn insert_member(&self, member: &NewMember) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();

        let result = sqlx::query(
            r#"
            INSERT INTO members (member_grade_no, uuid, gender, birth_date, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(member.member_grade_no)
        .bind(&member.uuid)
        .bind(&member.gender)
        .bind(member.birth_date)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert member: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Mark a member as withdrawn
    pub async fn withdraw_member(&self, member_no: i64) -> Result<()> {
        sqlx::query("UPDATE members SET deleted_at = ? WHERE member_no = ?")
            .bind(chrono::Utc::now().timestamp())
            .bind(member_no)
            .execute(&self.pool)
            .await
            .map_err(Error::Sqlx)?;
        Ok(())
    }

    /// Get a member by key
    pub async fn get_member(&self, member_no: i64) -> Result<Option<Member>> {
        let sql = format!("SELECT {MEMBER_COLUMNS} FROM members WHERE member_no = ?");

        sqlx::query_as::<_, Member>(&sql)
            .bind(member_no)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Sqlx)
    }

    /// Insert a new order
    pub async fn insert_order(&self, order: &NewOrder) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO orders (member_no, total_amount, created_at) VALUES (?, ?, ?)",
        )
        .bind(order.member_no)
        .bind(order.total_amount)
        .bind(order.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert order: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Insert a new coupon
    pub async fn insert_coupon(&self, coupon: &NewCoupon) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO coupons (name, type, expired_date, minimum_money, discount_amount)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&coupon.name)
        .bind(&coupon.coupon_type)
        .bind(coupon.expired_date)
        .bind(coupon.minimum_money)
        .bind(coupon.discount_amount)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to insert coupon: {}",
                e
            )))
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Grants of a coupon, ordered by member
    pub async fn given_coupons(&self, coupon_no: i64) -> Result<Vec<GivenCoupon>> {
        sqlx::query_as::<_, GivenCoupon>(
            r#"
            SELECT coupon_no, member_no, created_at
            FROM given_coupons
            WHERE coupon_no = ?
            ORDER BY member_no ASC
            "#,
        )
        .bind(coupon_no)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Sqlx)
    }

    /// Every coupon a member holds, newest coupon first
    pub async fn coupons_of_member(&self, member_no: i64) -> Result<Vec<Coupon>> {
        sqlx::query_as::<_, Coupon>(
            r#"
            SELECT c.coupon_no, c.name, c.type AS coupon_type, c.expired_date,
                   c.minimum_money, c.discount_amount
            FROM given_coupons g
            JOIN coupons c ON c.coupon_no = g.coupon_no
            WHERE g.member_no = ?
            ORDER BY c.coupon_no DESC
            "#,
        )
        .bind(member_no)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Sqlx)
    }

    /// Page of all members by key
    pub async fn page_members(&self, request: &PageRequest) -> Result<Vec<Member>> {
        let sql = format!(
            r#"
            SELECT {MEMBER_COLUMNS} FROM members
            WHERE member_no > ?
            ORDER BY member_no ASC
            LIMIT ? OFFSET ?
            "#
        );

        sqlx::query_as::<_, Member>(&sql)
            .bind(request.after_key())
            .bind(request.limit as i64)
            .bind(request.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Sqlx)
    }

    /// Page of members holding a grade
    pub async fn page_members_by_grade(
        &self,
        member_grade_no: i64,
        request: &PageRequest,
    ) -> Result<Vec<Member>> {
        let sql = format!(
            r#"
            SELECT {MEMBER_COLUMNS} FROM members
            WHERE member_grade_no = ? AND member_no > ?
            ORDER BY member_no ASC
            LIMIT ? OFFSET ?
            "#
        );

        sqlx::query_as::<_, Member>(&sql)
            .bind(member_grade_no)
            .bind(request.after_key())
            .bind(request.limit as i64)
            .bind(request.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Sqlx)
    }

    /// Page of members born on a month-day (`MM-DD`)
    pub async fn page_members_by_birthday(
        &self,
        month_day: &str,
        request: &PageRequest,
    ) -> Result<Vec<Member>> {
        let sql = format!(
            r#"
            SELECT {MEMBER_COLUMNS} FROM members
            WHERE strftime('%m-%d', birth_date) = ? AND member_no > ?
            ORDER BY member_no ASC
            LIMIT ? OFFSET ?
            "#
        );

        sqlx::query_as::<_, Member>(&sql)
            .bind(month_day)
            .bind(request.after_key())
            .bind(request.limit as i64)
            .bind(request.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Sqlx)
    }

    /// Page of per-member purchase totals for orders in `[start, end)` (unix seconds)
    pub async fn page_payments(
        &self,
        start: i64,
        end: i64,
        request: &PageRequest,
    ) -> Result<Vec<MemberPayment>> {
        sqlx::query_as::<_, MemberPayment>(
            r#"
            SELECT member_no, SUM(total_amount) AS total_amount
            FROM orders
            WHERE created_at >= ? AND created_at < ? AND member_no > ?
            GROUP BY member_no
            ORDER BY member_no ASC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(request.after_key())
        .bind(request.limit as i64)
        .bind(request.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Sqlx)
    }
}
