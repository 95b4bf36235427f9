//! Reference lookups used by the processors.

use crate::membership::ReferenceLookup;
use crate::{Error, Result};
use async_trait::async_trait;

use super::{Coupon, Database, Member, MemberGrade};

#[async_trait]
impl ReferenceLookup for Database {
    async fn find_coupon_by_name(&self, name: &str) -> Result<Option<Coupon>> {
        sqlx::query_as::<_, Coupon>(
            r#"
            SELECT coupon_no, name, type AS coupon_type, expired_date, minimum_money, discount_amount
            FROM coupons
            WHERE name = ?
            ORDER BY coupon_no DESC
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Sqlx)
    }

    async fn find_grade_by_id(&self, member_grade_no: i64) -> Result<Option<MemberGrade>> {
        sqlx::query_as::<_, MemberGrade>(
            "SELECT member_grade_no, grade FROM member_grades WHERE member_grade_no = ?",
        )
        .bind(member_grade_no)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Sqlx)
    }

    async fn find_member_by_id(&self, member_no: i64) -> Result<Option<Member>> {
        self.get_member(member_no).await
    }
}
