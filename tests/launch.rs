//! Parameter binding and launch guards

mod common;

use common::*;
use grade_batch::{BatchStatus, Error, Grade, JobKind, LaunchError};

async fn execution_rows(env: &TestEnv) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM job_executions")
        .fetch_one(env.db().pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn missing_parameter_is_rejected_before_any_execution_exists() {
    let env = TestEnv::new().await;

    let err = env
        .service
        .launch(JobKind::MemberGrade, [("startDate", "2024-01-01")])
        .await
        .unwrap_err();

    assert!(
        matches!(err, Error::Launch(LaunchError::MissingParameter(ref name)) if name == "endDate"),
        "got {err:?}"
    );
    assert_eq!(execution_rows(&env).await, 0);
}

#[tokio::test]
async fn malformed_values_are_launch_errors() {
    let env = TestEnv::new().await;

    let bad_date = env
        .service
        .launch(JobKind::BirthdayCoupon, [("runDate", "09/03/2024")])
        .await
        .unwrap_err();
    assert!(matches!(bad_date, Error::Launch(LaunchError::InvalidParameter { .. })));

    let bad_number = env
        .service
        .launch(
            JobKind::GradeCoupon,
            [("gradeNo", "two"), ("couponName", "VIP")],
        )
        .await
        .unwrap_err();
    assert!(matches!(bad_number, Error::Launch(LaunchError::InvalidParameter { .. })));

    let bad_coupon = env
        .service
        .launch(
            JobKind::GradeCoupon,
            [("gradeNo", "2"), ("couponName", "PLATINUM")],
        )
        .await
        .unwrap_err();
    assert!(matches!(bad_coupon, Error::Launch(LaunchError::InvalidParameter { .. })));

    let reversed_window = env
        .service
        .launch(
            JobKind::MemberGrade,
            [("startDate", "2024-02-01"), ("endDate", "2024-01-01")],
        )
        .await
        .unwrap_err();
    assert!(matches!(reversed_window, Error::Launch(_)));

    assert_eq!(execution_rows(&env).await, 0);
}

#[tokio::test]
async fn parameters_are_recorded_with_the_execution() {
    let env = TestEnv::new().await;
    add_coupon(env.db(), "Birthday Coupon").await;

    let execution = env
        .service
        .launch(JobKind::BirthdayCoupon, [("runDate", "2024-03-09")])
        .await
        .unwrap();

    let row = env
        .db()
        .get_job_execution(execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.job_name, "birthday_coupon_job");
    let params: grade_batch::JobParameters = serde_json::from_str(&row.parameters).unwrap();
    assert_eq!(params.date("runDate").unwrap(), date(2024, 3, 9));
    assert_eq!(params.job_key(), "runDate=2024-03-09");
}

#[tokio::test]
async fn concurrent_launches_of_one_instance_are_rejected() {
    let env = TestEnv::new().await;
    let db = env.db();
    add_coupon(db, "VIP Coupon").await;
    for i in 0..200 {
        add_member(db, &format!("v{i}"), grade_batch::Grade::Vip, None).await;
    }
    let params = [("gradeNo", "2"), ("couponName", "VIP")];

    let (a, b) = tokio::join!(
        env.service.launch(JobKind::GradeCoupon, params),
        env.service.launch(JobKind::GradeCoupon, params),
    );

    let results = [a, b];
    let completed = results
        .iter()
        .filter(|r| matches!(r, Ok(e) if e.status == BatchStatus::Completed))
        .count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(Error::JobAlreadyRunning { .. })))
        .count();
    assert_eq!(completed, 1);
    assert_eq!(rejected, 1);
}

#[tokio::test]
async fn launch_after_shutdown_is_refused() {
    let env = TestEnv::new().await;
    env.service.shutdown().await.unwrap();

    let err = env
        .service
        .launch(JobKind::BirthdayCoupon, [("runDate", "2024-03-09")])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
    assert_eq!(env.service.active_jobs(), 0);
}

#[tokio::test]
async fn shutdown_racing_a_launch_never_closes_the_pool_under_it() {
    let env = TestEnv::new().await;
    add_coupon(env.db(), "Birthday Coupon").await;
    for i in 0..20 {
        add_member(env.db(), &format!("m{i}"), Grade::Member, Some(date(1990, 3, 9))).await;
    }

    let service = env.service.clone();
    let launch = tokio::spawn(async move {
        service
            .launch(JobKind::BirthdayCoupon, [("runDate", "2024-03-09")])
            .await
    });
    env.service.shutdown().await.unwrap();

    match launch.await.unwrap() {
        Ok(execution) => assert!(
            matches!(execution.status, BatchStatus::Completed | BatchStatus::Stopped),
            "got {:?}",
            execution.status
        ),
        Err(err) => assert!(matches!(err, Error::ShuttingDown), "got {err:?}"),
    }
}
