//! Membership domain: grades, coupon names and the records flowing through the jobs

use crate::config::TierPolicy;
use crate::db::{Coupon, Member, MemberGrade};
use crate::error::{LaunchError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Membership tier
///
/// Discriminants are the `member_grades.member_grade_no` keys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Grade {
    /// Top tier
    Gvip = 1,
    /// Middle tier
    Vip = 2,
    /// Base tier every member falls back to
    Member = 3,
}

impl Grade {
    /// All grades, best first
    pub const ALL: [Grade; 3] = [Grade::Gvip, Grade::Vip, Grade::Member];

    /// Database key
    pub fn id(self) -> i64 {
        self as i64
    }

    /// Grade for a database key
    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Grade::Gvip),
            2 => Some(Grade::Vip),
            3 => Some(Grade::Member),
            _ => None,
        }
    }

    /// Name stored in `member_grades.grade`
    pub fn name(self) -> &'static str {
        match self {
            Grade::Gvip => "GVIP",
            Grade::Vip => "VIP",
            Grade::Member => "MEMBER",
        }
    }

    /// Coupon issued to holders of this grade, if any
    pub fn coupon(self) -> Option<CouponName> {
        match self {
            Grade::Gvip => Some(CouponName::Gvip),
            Grade::Vip => Some(CouponName::Vip),
            Grade::Member => None,
        }
    }
}

impl std::fmt::Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Grade earned by a purchase total under the default thresholds
pub fn tier_for_amount(total_amount: i64) -> Grade {
    TierPolicy::default().tier_for(total_amount)
}

/// Coupons the jobs know how to issue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CouponName {
    /// Monthly coupon for GVIP members
    Gvip,
    /// Monthly coupon for VIP members
    Vip,
    /// Coupon on the member's birthday
    Birthday,
}

impl CouponName {
    /// Parameter spelling (`GVIP`, `VIP`, `BIRTHDAY`)
    pub fn as_str(self) -> &'static str {
        match self {
            CouponName::Gvip => "GVIP",
            CouponName::Vip => "VIP",
            CouponName::Birthday => "BIRTHDAY",
        }
    }

    /// Name stored in `coupons.name`
    pub fn display_name(self) -> &'static str {
        match self {
            CouponName::Gvip => "GVIP Coupon",
            CouponName::Vip => "VIP Coupon",
            CouponName::Birthday => "Birthday Coupon",
        }
    }
}

impl std::fmt::Display for CouponName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CouponName {
    type Err = LaunchError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GVIP" => Ok(CouponName::Gvip),
            "VIP" => Ok(CouponName::Vip),
            "BIRTHDAY" => Ok(CouponName::Birthday),
            _ => Err(LaunchError::InvalidParameter {
                name: "couponName".to_string(),
                value: s.to_string(),
                reason: "expected one of GVIP, VIP, BIRTHDAY".to_string(),
            }),
        }
    }
}

/// One member's purchase total inside the grade window
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MemberPayment {
    /// Member key
    pub member_no: i64,
    /// Sum of `orders.total_amount`
    pub total_amount: i64,
}

/// Grade assignment to persist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeChange {
    /// Member key
    pub member_no: i64,
    /// New grade
    pub grade: Grade,
}

/// Coupon grant to persist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouponGrant {
    /// Coupon key
    pub coupon_no: i64,
    /// Member key
    pub member_no: i64,
}

/// Reference data the processors resolve explicitly
///
/// Every method returns `Ok(None)` when the row does not exist; the caller decides
/// whether absence is fatal.
#[async_trait]
pub trait ReferenceLookup: Send + Sync {
    /// Newest coupon (highest `coupon_no`) with this display name
    async fn find_coupon_by_name(&self, name: &str) -> Result<Option<Coupon>>;

    /// Grade row by key
    async fn find_grade_by_id(&self, member_grade_no: i64) -> Result<Option<MemberGrade>>;

    /// Member row by key
    async fn find_member_by_id(&self, member_no: i64) -> Result<Option<Member>>;
}
