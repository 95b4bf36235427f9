//! # grade-batch
//!
//! Chunked batch engine for membership tier updates and coupon issuance.
//!
//! Large record sets are read page by page, transformed record by record and written
//! in bounded transactional chunks. Every chunk commits together with its step's
//! progress, so a failed job restarts after the last committed chunk instead of from
//! the beginning.
//!
//! ## Jobs
//!
//! - `member_grade_job`: resets every member to MEMBER, recomputes grades from the
//!   purchase totals of a date window and grants the GVIP and VIP coupons
//! - `grade_coupon_job`: grants one coupon to every holder of one grade
//! - `birthday_coupon_job`: grants the birthday coupon to members born on the run date
//!
//! The grade job fires monthly and the birthday job daily, on cron triggers evaluated
//! in the configured timezone.
//!
//! ## Quick Start
//!
//! ```no_run
//! use grade_batch::{BatchService, Config, JobKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = BatchService::new(Config::default()).await?;
//!
//!     // Subscribe to events
//!     let mut events = service.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let execution = service
//!         .launch(
//!             JobKind::MemberGrade,
//!             [("startDate", "2024-01-01"), ("endDate", "2024-02-01")],
//!         )
//!         .await?;
//!     println!("{} finished {}", execution.job_name, execution.status);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Chunked batch engine: readers, processors, writers, steps and jobs
pub mod batch;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// The membership jobs
pub mod jobs;
/// Membership grades, coupons and reference lookups
pub mod membership;
/// Retry logic with exponential backoff
pub mod retry;
/// Cron triggers
pub mod scheduler;
/// Scheduler task execution
pub mod scheduler_task;
/// Service handle and lifecycle
pub mod service;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use batch::{Job, JobParameters, JobRunner};
pub use config::{Config, DuplicatePolicy, TierPolicy};
pub use db::Database;
pub use error::{DatabaseError, Error, LaunchError, Result};
pub use jobs::{JobFactory, JobKind};
pub use membership::{CouponName, Grade, ReferenceLookup};
pub use scheduler::{Scheduler, Trigger};
pub use service::BatchService;
pub use types::{
    BatchStatus, Event, JobExecution, JobExecutionId, JobInstanceId, StepExecution,
    StepExecutionId,
};

/// Helper function to run the service with graceful signal handling.
///
/// Spawns the scheduler, waits for a termination signal and then calls the service's
/// `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use grade_batch::{BatchService, Config, run_with_shutdown};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = Arc::new(BatchService::new(Config::default()).await?);
///
///     // Run the triggers until SIGINT/SIGTERM
///     run_with_shutdown(service).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(service: std::sync::Arc<BatchService>) -> Result<()> {
    let scheduler = service.spawn_scheduler()?;
    wait_for_signal().await;
    service.shutdown().await?;

    if let Some(handle) = scheduler
        && let Err(e) = handle.await
    {
        tracing::warn!(error = %e, "Scheduler task ended abnormally");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
