//! Service fixtures and membership data builders

use chrono::{NaiveDate, TimeZone};
use grade_batch::db::{NewCoupon, NewMember, NewOrder};
use grade_batch::{BatchService, Config, Database, Grade};
use std::sync::Arc;
use tempfile::TempDir;

/// A service over a throwaway database
pub struct TestEnv {
    pub service: Arc<BatchService>,
    pub dir: TempDir,
}

impl TestEnv {
    /// Service with the default configuration
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Service with a tweaked configuration
    pub async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.persistence.database_path = dir.path().join("batch.db");
        config.schedule.enabled = false;
        config.retry.initial_delay = std::time::Duration::from_millis(1);
        config.retry.max_delay = std::time::Duration::from_millis(5);
        tweak(&mut config);

        let service = Arc::new(BatchService::new(config).await.unwrap());
        Self { service, dir }
    }

    pub fn db(&self) -> &Database {
        self.service.database()
    }
}

/// 12:00 on `date` in Asia/Seoul, as unix seconds
pub fn kst_noon(y: i32, m: u32, d: u32) -> i64 {
    chrono_tz::Asia::Seoul
        .with_ymd_and_hms(y, m, d, 12, 0, 0)
        .unwrap()
        .timestamp()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub async fn add_member(db: &Database, uuid: &str, grade: Grade, birth_date: Option<NaiveDate>) -> i64 {
    db.insert_member(&NewMember {
        uuid: uuid.to_string(),
        member_grade_no: grade.id(),
        gender: None,
        birth_date,
    })
    .await
    .unwrap()
}

pub async fn add_order(db: &Database, member_no: i64, total_amount: i64, created_at: i64) {
    db.insert_order(&NewOrder {
        member_no,
        total_amount,
        created_at,
    })
    .await
    .unwrap();
}

pub async fn add_coupon(db: &Database, name: &str) -> i64 {
    db.insert_coupon(&NewCoupon {
        name: name.to_string(),
        coupon_type: "AMOUNT".to_string(),
        expired_date: 30,
        minimum_money: 30_000,
        discount_amount: 5_000.0,
    })
    .await
    .unwrap()
}

pub async fn grade_of(db: &Database, member_no: i64) -> Grade {
    let member = db.get_member(member_no).await.unwrap().unwrap();
    Grade::from_id(member.member_grade_no).unwrap()
}

pub async fn holders(db: &Database, coupon_no: i64) -> Vec<i64> {
    db.given_coupons(coupon_no)
        .await
        .unwrap()
        .into_iter()
        .map(|g| g.member_no)
        .collect()
}
