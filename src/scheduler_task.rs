//! Background task that fires the cron triggers
//!
//! The task sleeps until the next fire time, launches every trigger due at that
//! instant on its own tokio task, and loops. A failed job is logged and never stops
//! the task; cancellation of the service token ends it.
//!
//! # Example
//!
//! ```no_run
//! use grade_batch::{BatchService, Config};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = Arc::new(BatchService::new(Config::default()).await?);
//! let handle = service.spawn_scheduler()?;
//! # Ok(())
//! # }
//! ```

use crate::scheduler::Scheduler;
use crate::service::BatchService;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Fires the scheduler's triggers against a [`BatchService`]
pub struct SchedulerTask {
    scheduler: Arc<Scheduler>,
    service: Arc<BatchService>,
}

impl SchedulerTask {
    /// Creates a new scheduler task
    pub fn new(service: Arc<BatchService>, scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler, service }
    }

    /// Run until the service is shut down
    pub async fn run(self) {
        let cancel = self.service.cancellation_token();
        info!(
            triggers = self.scheduler.triggers().len(),
            timezone = %self.scheduler.timezone(),
            "Scheduler task started"
        );

        let mut cursor = Utc::now();
        loop {
            let Some((fire, due)) = self.scheduler.due_after(cursor) else {
                warn!("No upcoming fire times, scheduler task exiting");
                break;
            };
            let fire_utc = fire.with_timezone(&Utc);
            let wait = (fire_utc - Utc::now()).to_std().unwrap_or_default();
            debug!(next_fire = %fire, wait_secs = wait.as_secs(), "Sleeping until next trigger");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Scheduler task shutting down");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            for trigger in due {
                let kind = trigger.kind();
                let params = match trigger.params_for(&fire) {
                    Ok(params) => params,
                    Err(e) => {
                        error!(job = %kind, error = %e, "Could not derive trigger parameters");
                        continue;
                    }
                };

                info!(job = %kind, job_key = %params.job_key(), fire = %fire, "Trigger fired");
                let service = self.service.clone();
                tokio::spawn(async move {
                    match service.launch_with(kind, params).await {
                        Ok(execution) if execution.is_success() => {
                            info!(job = %kind, execution_id = %execution.id, "Scheduled job completed");
                        }
                        Ok(execution) => {
                            warn!(
                                job = %kind,
                                execution_id = %execution.id,
                                status = %execution.status,
                                exit_message = execution.exit_message.as_deref().unwrap_or(""),
                                "Scheduled job did not complete"
                            );
                        }
                        Err(e) => {
                            error!(job = %kind, error = %e, "Scheduled job could not run");
                        }
                    }
                });
            }

            cursor = latest(cursor, fire_utc);
        }

        info!("Scheduler task stopped");
    }
}

fn latest(a: DateTime<Utc>, b: DateTime<Utc>) -> DateTime<Utc> {
    if b > a { b } else { a }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn service(dir: &TempDir) -> Arc<BatchService> {
        let mut config = Config::default();
        config.persistence.database_path = dir.path().join("batch.db");
        Arc::new(BatchService::new(config).await.unwrap())
    }

    #[tokio::test]
    async fn stops_when_the_service_shuts_down() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir).await;
        let handle = service.spawn_scheduler().unwrap().unwrap();

        service.shutdown().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.is_ok(), "scheduler task should exit on shutdown");
    }

    #[tokio::test]
    async fn disabled_schedule_spawns_nothing() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.persistence.database_path = dir.path().join("batch.db");
        config.schedule.enabled = false;
        let service = Arc::new(BatchService::new(config).await.unwrap());

        assert!(service.spawn_scheduler().unwrap().is_none());
    }

    #[tokio::test]
    async fn every_second_trigger_launches_the_birthday_job() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.persistence.database_path = dir.path().join("batch.db");
        config.schedule.birthday_cron = "* * * * * *".to_string();
        let service = Arc::new(BatchService::new(config).await.unwrap());
        let mut events = service.subscribe();

        let handle = service.spawn_scheduler().unwrap().unwrap();

        // no birthday coupon exists, so the job starts and then fails; the task keeps going
        let started = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Ok(crate::types::Event::JobStarted { job, .. }) = events.recv().await
                    && job == "birthday_coupon_job"
                {
                    return;
                }
            }
        })
        .await;
        assert!(started.is_ok(), "birthday trigger should fire");
        assert!(!handle.is_finished());

        service.shutdown().await.unwrap();
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let early = DateTime::from_timestamp(100, 0).unwrap();
        let late = DateTime::from_timestamp(200, 0).unwrap();
        assert_eq!(latest(early, late), late);
        assert_eq!(latest(late, early), late);
    }
}
