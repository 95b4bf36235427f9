//! The batch service: database, runner, scheduler and events behind one handle.
//!
//! ## Submodules
//!
//! - [`lifecycle`]: graceful shutdown

use crate::batch::{JobParameters, JobRunner};
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::jobs::{JobFactory, JobKind};
use crate::scheduler::Scheduler;
use crate::scheduler_task::SchedulerTask;
use crate::types::{Event, JobExecution};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod lifecycle;

/// Handle to a running batch service
///
/// Cheap to share behind an `Arc`; jobs launched concurrently share the connection
/// pool and the immutable configuration.
pub struct BatchService {
    db: Arc<Database>,
    config: Arc<Config>,
    factory: JobFactory,
    runner: JobRunner,
    event_tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
    active_jobs: Arc<AtomicUsize>,
}

impl BatchService {
    /// Start the service
    ///
    /// - Validates the configuration
    /// - Opens/creates the SQLite database and runs migrations
    /// - Marks executions a crashed process left running as FAILED so they can restart
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let db = Arc::new(Database::new(&config.persistence.database_path).await?);

        let abandoned = db.mark_abandoned_executions().await?;
        if abandoned > 0 {
            tracing::warn!(
                abandoned,
                "Recovered job executions left running by a previous process"
            );
        }

        let (event_tx, _rx) = broadcast::channel(1000);
        let cancel = CancellationToken::new();
        let config = Arc::new(config);

        let runner = JobRunner::new(db.clone(), &config, event_tx.clone(), cancel.clone());
        let factory = JobFactory::new(db.clone(), config.clone());

        tracing::info!(
            database = %config.persistence.database_path.display(),
            timezone = %config.schedule.timezone,
            "Batch service started"
        );

        Ok(Self {
            db,
            config,
            factory,
            runner,
            event_tx,
            cancel,
            active_jobs: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Subscribe to job and step events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Launch a job from raw string parameters
    ///
    /// Parameters are parsed against the job's schema first; a missing or malformed
    /// parameter is an [`Error::Launch`] and no execution is recorded.
    pub async fn launch<I, K, V>(&self, kind: JobKind, raw: I) -> Result<JobExecution>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let params = JobParameters::parse(raw, kind.schema())?;
        self.launch_with(kind, params).await
    }

    /// Launch a job with already-bound parameters and wait for it to finish
    pub async fn launch_with(&self, kind: JobKind, params: JobParameters) -> Result<JobExecution> {
        // counted before the check so a concurrent shutdown waits for this launch
        let _active = ActiveJob::enter(&self.active_jobs);
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let job = self.factory.build(kind, &params)?;
        self.runner.run(job, params).await
    }

    /// Spawn the cron scheduler, unless scheduling is disabled
    pub fn spawn_scheduler(self: &Arc<Self>) -> Result<Option<JoinHandle<()>>> {
        if !self.config.schedule.enabled {
            tracing::info!("Scheduling disabled, no triggers spawned");
            return Ok(None);
        }

        let scheduler = Scheduler::from_config(&self.config.schedule)?;
        let task = SchedulerTask::new(self.clone(), Arc::new(scheduler));
        Ok(Some(tokio::spawn(task.run())))
    }

    /// Database handle
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Effective configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of jobs currently running
    pub fn active_jobs(&self) -> usize {
        self.active_jobs.load(Ordering::SeqCst)
    }

    /// Token cancelled when shutdown begins
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Counts a running job until dropped
struct ActiveJob(Arc<AtomicUsize>);

impl ActiveJob {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveJob {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
