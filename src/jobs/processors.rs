//! Processors that resolve reference data and produce grade changes and grants

use crate::batch::ItemProcessor;
use crate::config::TierPolicy;
use crate::db::Member;
use crate::error::{Error, Result};
use crate::membership::{CouponGrant, CouponName, Grade, GradeChange, MemberPayment, ReferenceLookup};
use async_trait::async_trait;
use std::sync::Arc;

/// Puts every member back on the base grade before grades are recomputed
pub struct ResetGradeProcessor {
    lookup: Arc<dyn ReferenceLookup>,
}

impl ResetGradeProcessor {
    /// Processor checking the base grade through `lookup`
    pub fn new(lookup: Arc<dyn ReferenceLookup>) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl ItemProcessor for ResetGradeProcessor {
    type Input = Member;
    type Output = GradeChange;

    async fn open(&mut self) -> Result<()> {
        let base = Grade::Member;
        if self.lookup.find_grade_by_id(base.id()).await?.is_none() {
            return Err(Error::not_found("grade", base.id()));
        }
        Ok(())
    }

    async fn process(&self, member: Member) -> Result<Option<GradeChange>> {
        Ok(Some(GradeChange {
            member_no: member.member_no,
            grade: Grade::Member,
        }))
    }
}

/// Maps a member's purchase total to the grade it earns
pub struct UpdateGradeProcessor {
    lookup: Arc<dyn ReferenceLookup>,
    policy: TierPolicy,
}

impl UpdateGradeProcessor {
    /// Processor using `policy` thresholds
    pub fn new(lookup: Arc<dyn ReferenceLookup>, policy: TierPolicy) -> Self {
        Self { lookup, policy }
    }
}

#[async_trait]
impl ItemProcessor for UpdateGradeProcessor {
    type Input = MemberPayment;
    type Output = GradeChange;

    async fn open(&mut self) -> Result<()> {
        for grade in Grade::ALL {
            if self.lookup.find_grade_by_id(grade.id()).await?.is_none() {
                return Err(Error::not_found("grade", grade.id()));
            }
        }
        Ok(())
    }

    async fn process(&self, payment: MemberPayment) -> Result<Option<GradeChange>> {
        let member = self
            .lookup
            .find_member_by_id(payment.member_no)
            .await?
            .ok_or_else(|| Error::not_found("member", payment.member_no))?;

        if member.deleted_at.is_some() {
            return Ok(None);
        }

        Ok(Some(GradeChange {
            member_no: member.member_no,
            grade: self.policy.tier_for(payment.total_amount),
        }))
    }
}

/// Grants one coupon, resolved by name when the step opens, to every active member
pub struct GrantCouponProcessor {
    lookup: Arc<dyn ReferenceLookup>,
    coupon: CouponName,
    grade: Option<Grade>,
    coupon_no: Option<i64>,
}

impl GrantCouponProcessor {
    /// Processor granting `coupon`
    pub fn new(lookup: Arc<dyn ReferenceLookup>, coupon: CouponName) -> Self {
        Self {
            lookup,
            coupon,
            grade: None,
            coupon_no: None,
        }
    }

    /// Also require the grade row the source filters by to exist
    pub fn for_grade(mut self, grade: Grade) -> Self {
        self.grade = Some(grade);
        self
    }
}

#[async_trait]
impl ItemProcessor for GrantCouponProcessor {
    type Input = Member;
    type Output = CouponGrant;

    async fn open(&mut self) -> Result<()> {
        if let Some(grade) = self.grade
            && self.lookup.find_grade_by_id(grade.id()).await?.is_none()
        {
            return Err(Error::not_found("grade", grade.id()));
        }

        let name = self.coupon.display_name();
        let coupon = self
            .lookup
            .find_coupon_by_name(name)
            .await?
            .ok_or_else(|| Error::not_found("coupon", name))?;

        tracing::debug!(coupon = name, coupon_no = coupon.coupon_no, "Resolved coupon");
        self.coupon_no = Some(coupon.coupon_no);
        Ok(())
    }

    async fn process(&self, member: Member) -> Result<Option<CouponGrant>> {
        let coupon_no = self
            .coupon_no
            .ok_or_else(|| Error::not_found("coupon", self.coupon.display_name()))?;

        if member.deleted_at.is_some() {
            return Ok(None);
        }

        Ok(Some(CouponGrant {
            coupon_no,
            member_no: member.member_no,
        }))
    }
}
