use super::test_db;
use crate::db::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_database_creation() {
    let (db, _file) = test_db().await;

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(&db.pool)
            .await
            .unwrap();

    for table in [
        "job_instances",
        "job_executions",
        "step_executions",
        "member_grades",
        "members",
        "coupons",
        "given_coupons",
        "orders",
        "schema_version",
    ] {
        assert!(tables.contains(&table.to_string()), "missing table {table}");
    }

    db.close().await;
}

#[tokio::test]
async fn test_grades_are_seeded() {
    let (db, _file) = test_db().await;

    let grades: Vec<(i64, String)> =
        sqlx::query_as("SELECT member_grade_no, grade FROM member_grades ORDER BY member_grade_no")
            .fetch_all(&db.pool)
            .await
            .unwrap();

    assert_eq!(
        grades,
        vec![
            (1, "GVIP".to_string()),
            (2, "VIP".to_string()),
            (3, "MEMBER".to_string())
        ]
    );
}

#[tokio::test]
async fn test_reopen_does_not_reapply_migrations() {
    let temp_file = NamedTempFile::new().unwrap();

    let db = Database::new(temp_file.path()).await.unwrap();
    db.close().await;
    let db = Database::new(temp_file.path()).await.unwrap();

    let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version")
        .fetch_all(&db.pool)
        .await
        .unwrap();
    assert_eq!(versions, vec![1, 2]);

    let grade_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM member_grades")
        .fetch_one(&db.pool)
        .await
        .unwrap();
    assert_eq!(grade_rows, 3);
}

#[tokio::test]
async fn test_foreign_keys_are_enforced() {
    let (db, _file) = test_db().await;

    let result = db
        .insert_order(&NewOrder {
            member_no: 404,
            total_amount: 1_000,
            created_at: 0,
        })
        .await;
    assert!(result.is_err(), "order for a missing member must be rejected");
}
