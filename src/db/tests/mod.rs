mod migrations;

use crate::db::*;
use tempfile::NamedTempFile;

/// Fresh migrated database; keep the file alive for the duration of the test
pub(super) async fn test_db() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (db, temp_file)
}

pub(super) async fn insert_member(db: &Database, uuid: &str, birth_date: Option<&str>) -> i64 {
    db.insert_member(&NewMember {
        uuid: uuid.to_string(),
        member_grade_no: 3,
        gender: Some("F".to_string()),
        birth_date: birth_date.map(|d| d.parse().unwrap()),
    })
    .await
    .unwrap()
}

pub(super) async fn insert_coupon(db: &Database, name: &str) -> i64 {
    db.insert_coupon(&NewCoupon {
        name: name.to_string(),
        coupon_type: "PERCENT".to_string(),
        expired_date: 30,
        minimum_money: 10_000,
        discount_amount: 0.1,
    })
    .await
    .unwrap()
}
