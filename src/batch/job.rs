//! Jobs and the runner that executes them.
//!
//! Restart rules, per step, against the last execution of the same step within the
//! job instance:
//! - none, or last one COMPLETED and the step allows restart: run from the start
//! - last one COMPLETED and the step does not allow restart: skip
//! - anything else: resume after the records the last execution committed
//!
//! A step that reads rows an earlier step rewrites opts into
//! [`StepSettings::restart_with_upstream`](crate::batch::StepSettings::restart_with_upstream):
//! once an earlier step of the same execution re-ran a completed step, it starts over
//! instead of resuming.

use crate::batch::params::JobParameters;
use crate::batch::step::{Step, StepContext};
use crate::config::{Config, RetryConfig};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{BatchStatus, Event, JobExecution, JobExecutionId, JobInstanceId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

/// An ordered list of steps under a name
pub struct Job {
    name: String,
    steps: Vec<Box<dyn Step>>,
}

impl Job {
    /// Start building a job
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Job name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step names in execution order
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .finish()
    }
}

/// Builder for [`Job`]
pub struct JobBuilder {
    name: String,
    steps: Vec<Box<dyn Step>>,
}

impl JobBuilder {
    /// Append a step
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Finish the job; it needs at least one step and unique step names
    pub fn build(self) -> Result<Job> {
        if self.steps.is_empty() {
            return Err(Error::Config {
                message: format!("job {} has no steps", self.name),
                key: None,
            });
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name()) {
                return Err(Error::Config {
                    message: format!("job {} has two steps named {}", self.name, step.name()),
                    key: None,
                });
            }
        }

        Ok(Job {
            name: self.name,
            steps: self.steps,
        })
    }
}

/// Executes jobs and records their executions
pub struct JobRunner {
    db: Arc<Database>,
    retry: RetryConfig,
    prevent_completed_rerun: bool,
    event_tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
    active: Mutex<HashSet<JobInstanceId>>,
}

impl JobRunner {
    /// Create a runner
    pub fn new(
        db: Arc<Database>,
        config: &Config,
        event_tx: broadcast::Sender<Event>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            db,
            retry: config.retry.clone(),
            prevent_completed_rerun: config.jobs.prevent_completed_rerun,
            event_tx,
            cancel,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Run a job with its launch parameters
    ///
    /// Step failures do not produce an `Err`: the returned execution carries the
    /// FAILED status and message. `Err` means the job could not be run or its
    /// bookkeeping failed.
    pub async fn run(&self, mut job: Job, params: JobParameters) -> Result<JobExecution> {
        let job_key = params.job_key();
        let instance = self
            .db
            .find_or_create_job_instance(job.name(), &job_key)
            .await?;

        if !self.active.lock().await.insert(instance) {
            return Err(Error::JobAlreadyRunning {
                job: job.name().to_string(),
                job_key,
            });
        }

        let result = self.run_instance(&mut job, &params, instance, &job_key).await;
        self.active.lock().await.remove(&instance);
        result
    }

    async fn run_instance(
        &self,
        job: &mut Job,
        params: &JobParameters,
        instance: JobInstanceId,
        job_key: &str,
    ) -> Result<JobExecution> {
        if let Some(last) = self.db.last_job_execution(instance).await? {
            let status = last.status();
            if status.is_running() {
                return Err(Error::JobAlreadyRunning {
                    job: job.name().to_string(),
                    job_key: job_key.to_string(),
                });
            }
            if status == BatchStatus::Completed && self.prevent_completed_rerun {
                return Err(Error::JobRerunRefused {
                    job: job.name().to_string(),
                    job_key: job_key.to_string(),
                });
            }
        }

        let parameters_json = serde_json::to_string(params)?;
        let execution_id = self
            .db
            .create_job_execution(instance, &parameters_json)
            .await?;
        let started = Instant::now();

        let (status, exit_message) = match self
            .execute_steps(job, instance, execution_id, job_key)
            .await
        {
            Ok(finished) => finished,
            Err(e) => {
                let message = e.to_string();
                if let Err(finish_err) = self
                    .db
                    .finish_job_execution(execution_id, BatchStatus::Failed, Some(&message))
                    .await
                {
                    tracing::error!(error = %finish_err, "Failed to record job failure");
                }
                let _ = self.event_tx.send(Event::JobFinished {
                    execution_id,
                    job: job.name().to_string(),
                    status: BatchStatus::Failed,
                });
                return Err(e);
            }
        };

        self.db
            .finish_job_execution(execution_id, status, exit_message.as_deref())
            .await?;

        match status {
            BatchStatus::Completed => tracing::info!(
                job = %job.name(),
                execution_id = %execution_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Job completed"
            ),
            _ => tracing::warn!(
                job = %job.name(),
                execution_id = %execution_id,
                status = %status,
                exit_message = exit_message.as_deref().unwrap_or(""),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Job did not complete"
            ),
        }
        let _ = self.event_tx.send(Event::JobFinished {
            execution_id,
            job: job.name().to_string(),
            status,
        });

        let steps = self
            .db
            .step_executions_for(execution_id)
            .await?
            .into_iter()
            .map(Into::into)
            .collect();

        Ok(JobExecution {
            id: execution_id,
            instance_id: instance,
            job_name: job.name().to_string(),
            status,
            exit_message,
            steps,
        })
    }

    async fn execute_steps(
        &self,
        job: &mut Job,
        instance: JobInstanceId,
        execution_id: JobExecutionId,
        job_key: &str,
    ) -> Result<(BatchStatus, Option<String>)> {
        self.db
            .update_job_status(execution_id, BatchStatus::Started)
            .await?;
        tracing::info!(job = %job.name, job_key, execution_id = %execution_id, "Job started");
        let _ = self.event_tx.send(Event::JobStarted {
            execution_id,
            job: job.name.clone(),
            job_key: job_key.to_string(),
        });

        // set once a completed step runs again in this execution
        let mut upstream_rerun = false;

        for step in job.steps.iter_mut() {
            let step_name = step.name().to_string();

            if self.cancel.is_cancelled() {
                return Ok((
                    BatchStatus::Stopped,
                    Some(format!("cancelled before step {step_name}")),
                ));
            }

            let start_offset = match self.db.last_step_execution(instance, &step_name).await? {
                Some(prior) if prior.status() == BatchStatus::Completed => {
                    if !step.allow_restart_if_complete() {
                        tracing::info!(step = %step_name, "Step already completed, skipping");
                        let _ = self.event_tx.send(Event::StepSkipped {
                            execution_id,
                            step: step_name,
                        });
                        continue;
                    }
                    upstream_rerun = true;
                    0
                }
                Some(_) if upstream_rerun && step.restarts_with_upstream() => 0,
                Some(prior) => prior.resume_offset(),
                None => 0,
            };

            let step_execution_id = self
                .db
                .create_step_execution(execution_id, &step_name, start_offset)
                .await?;
            tracing::info!(step = %step_name, start_offset, "Step started");
            let _ = self.event_tx.send(Event::StepStarted {
                execution_id,
                step: step_name.clone(),
                start_offset,
            });

            let ctx = StepContext {
                db: &self.db,
                job_execution_id: execution_id,
                step_execution_id,
                start_offset,
                retry: &self.retry,
                cancel: &self.cancel,
                events: &self.event_tx,
            };

            match step.execute(&ctx).await {
                Ok(outcome) => {
                    self.db
                        .finish_step_execution(step_execution_id, outcome.status, None)
                        .await?;
                    tracing::info!(
                        step = %step_name,
                        status = %outcome.status,
                        read = outcome.counters.read_count,
                        written = outcome.counters.write_count,
                        filtered = outcome.counters.filter_count,
                        commits = outcome.counters.commit_count,
                        "Step finished"
                    );
                    let _ = self.event_tx.send(Event::StepCompleted {
                        execution_id,
                        step: step_name.clone(),
                        status: outcome.status,
                        write_count: outcome.counters.write_count,
                    });

                    if outcome.status == BatchStatus::Stopped {
                        return Ok((
                            BatchStatus::Stopped,
                            Some(format!("stopped during step {step_name}")),
                        ));
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    self.db
                        .finish_step_execution(step_execution_id, BatchStatus::Failed, Some(&message))
                        .await?;
                    tracing::error!(step = %step_name, error = %e, "Step failed");
                    let _ = self.event_tx.send(Event::StepFailed {
                        execution_id,
                        step: step_name.clone(),
                        error: message.clone(),
                    });

                    if step.is_critical() {
                        return Ok((
                            BatchStatus::Failed,
                            Some(format!("step {step_name} failed: {message}")),
                        ));
                    }
                    tracing::warn!(step = %step_name, "Non-critical step failed, continuing");
                }
            }
        }

        Ok((BatchStatus::Completed, None))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::test_support::{ScratchWriter, VecSource, fast_retry, scratch_values};
    use crate::batch::{ChunkStep, FnProcessor, ItemWriter, StepSettings, WriteMode};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::NamedTempFile;

    struct Fixture {
        db: Arc<Database>,
        runner: JobRunner,
        events: broadcast::Receiver<Event>,
        _file: NamedTempFile,
    }

    async fn fixture(config: Config) -> Fixture {
        let file = NamedTempFile::new().unwrap();
        let db = Arc::new(Database::new(file.path()).await.unwrap());
        sqlx::query("CREATE TABLE scratch_items (value INTEGER PRIMARY KEY)")
            .execute(db.pool())
            .await
            .unwrap();
        let (tx, rx) = broadcast::channel(256);
        let mut config = config;
        config.retry = fast_retry();
        let runner = JobRunner::new(db.clone(), &config, tx, CancellationToken::new());
        Fixture {
            db,
            runner,
            events: rx,
            _file: file,
        }
    }

    fn insert_step(
        name: &str,
        keys: Vec<i64>,
        chunk: usize,
        writer: ScratchWriter,
    ) -> impl Step + 'static {
        ChunkStep::new(
            StepSettings::new(name, chunk),
            VecSource::new(keys),
            FnProcessor::new(|n: i64| Ok(Some(n))),
            writer,
        )
    }

    /// Step whose writer fails on `fail_on` only while the flag is set
    struct FlakyWriter {
        inner: ScratchWriter,
        armed: Arc<AtomicBool>,
        fail_on: i64,
    }

    #[async_trait::async_trait]
    impl ItemWriter for FlakyWriter {
        type Item = i64;

        fn mode(&self) -> WriteMode {
            WriteMode::Insert
        }

        async fn write(&self, conn: &mut sqlx::SqliteConnection, chunk: &[i64]) -> Result<u64> {
            if self.armed.load(Ordering::SeqCst) && chunk.contains(&self.fail_on) {
                return Err(Error::WriteConflict("armed failure".into()));
            }
            self.inner.write(conn, chunk).await
        }
    }

    /// Keeps written values in memory; fails on `fail_on` while armed
    struct MemoryWriter {
        values: Arc<std::sync::Mutex<Vec<i64>>>,
        armed: Arc<AtomicBool>,
        fail_on: i64,
    }

    #[async_trait::async_trait]
    impl ItemWriter for MemoryWriter {
        type Item = i64;

        fn mode(&self) -> WriteMode {
            WriteMode::Insert
        }

        async fn write(&self, _conn: &mut sqlx::SqliteConnection, chunk: &[i64]) -> Result<u64> {
            if self.armed.load(Ordering::SeqCst) && chunk.contains(&self.fail_on) {
                return Err(Error::WriteConflict("armed failure".into()));
            }
            self.values.lock().unwrap().extend_from_slice(chunk);
            Ok(chunk.len() as u64)
        }
    }

    fn params() -> JobParameters {
        JobParameters::new().with_string("run", "1")
    }

    #[test]
    fn builder_rejects_empty_and_duplicate_steps() {
        assert!(Job::builder("empty").build().is_err());

        let dup = Job::builder("dup")
            .step(insert_step("a", vec![], 1, ScratchWriter::new()))
            .step(insert_step("a", vec![], 1, ScratchWriter::new()))
            .build();
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn steps_run_in_order_and_are_recorded() {
        let mut fx = fixture(Config::default()).await;
        let job = Job::builder("ordered")
            .step(insert_step("first", vec![1, 2, 3], 2, ScratchWriter::new()))
            .step(insert_step("second", vec![10, 20], 2, ScratchWriter::new()))
            .build()
            .unwrap();

        let execution = fx.runner.run(job, params()).await.unwrap();

        assert!(execution.is_success());
        let names: Vec<_> = execution.steps.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(execution.step("first").unwrap().commit_count, 2);
        assert_eq!(scratch_values(&fx.db).await, vec![1, 2, 3, 10, 20]);

        let mut kinds = Vec::new();
        while let Ok(event) = fx.events.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert_eq!(kinds.first().map(String::as_str), Some("job_started"));
        assert_eq!(kinds.last().map(String::as_str), Some("job_finished"));
    }

    #[tokio::test]
    async fn critical_failure_skips_remaining_steps() {
        let fx = fixture(Config::default()).await;
        let job = Job::builder("critical")
            .step(insert_step("boom", vec![1, 2], 5, ScratchWriter::new().fail_on(2)))
            .step(insert_step("never", vec![9], 5, ScratchWriter::new()))
            .build()
            .unwrap();

        let execution = fx.runner.run(job, params()).await.unwrap();

        assert_eq!(execution.status, BatchStatus::Failed);
        assert!(execution.exit_message.unwrap().contains("boom"));
        assert_eq!(execution.steps.len(), 1);
        assert_eq!(execution.steps[0].status, BatchStatus::Failed);
        assert!(scratch_values(&fx.db).await.is_empty());
    }

    #[tokio::test]
    async fn non_critical_failure_lets_the_job_continue() {
        let fx = fixture(Config::default()).await;
        let failing = ChunkStep::new(
            StepSettings::new("optional", 5).non_critical(),
            VecSource::new(vec![1]),
            FnProcessor::new(|n: i64| Ok(Some(n))),
            ScratchWriter::new().fail_on(1),
        );
        let job = Job::builder("lenient")
            .step(failing)
            .step(insert_step("after", vec![7], 5, ScratchWriter::new()))
            .build()
            .unwrap();

        let execution = fx.runner.run(job, params()).await.unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.step("optional").unwrap().status, BatchStatus::Failed);
        assert_eq!(execution.step("after").unwrap().status, BatchStatus::Completed);
        assert_eq!(scratch_values(&fx.db).await, vec![7]);
    }

    #[tokio::test]
    async fn failed_job_resumes_after_last_committed_chunk() {
        let fx = fixture(Config::default()).await;
        let armed = Arc::new(AtomicBool::new(true));
        let build = |armed: Arc<AtomicBool>| {
            Job::builder("resumable")
                .step(ChunkStep::new(
                    StepSettings::new("load", 3),
                    VecSource::new((1..=10).collect()),
                    FnProcessor::new(|n: i64| Ok(Some(n))),
                    FlakyWriter {
                        inner: ScratchWriter::new(),
                        armed,
                        fail_on: 5,
                    },
                ))
                .build()
                .unwrap()
        };

        let first = fx.runner.run(build(armed.clone()), params()).await.unwrap();
        assert_eq!(first.status, BatchStatus::Failed);
        assert_eq!(scratch_values(&fx.db).await, vec![1, 2, 3]);

        armed.store(false, Ordering::SeqCst);
        let second = fx.runner.run(build(armed.clone()), params()).await.unwrap();

        assert!(second.is_success());
        assert_eq!(second.instance_id, first.instance_id);
        let step = second.step("load").unwrap();
        assert_eq!(step.start_offset, 3);
        assert_eq!(step.read_count, 7);
        assert_eq!(scratch_values(&fx.db).await, (1..=10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn rerun_of_an_earlier_step_restarts_later_steps_from_zero() {
        let fx = fixture(Config::default()).await;
        let armed = Arc::new(AtomicBool::new(true));
        let values = Arc::new(std::sync::Mutex::new(Vec::new()));
        let build = || {
            Job::builder("dependent")
                .step(insert_step("prepare", vec![], 5, ScratchWriter::new()))
                .step(ChunkStep::new(
                    StepSettings::new("load", 3).restart_with_upstream(),
                    VecSource::new((1..=10).collect()),
                    FnProcessor::new(|n: i64| Ok(Some(n))),
                    MemoryWriter {
                        values: values.clone(),
                        armed: armed.clone(),
                        fail_on: 5,
                    },
                ))
                .build()
                .unwrap()
        };

        let first = fx.runner.run(build(), params()).await.unwrap();
        assert_eq!(first.status, BatchStatus::Failed);

        armed.store(false, Ordering::SeqCst);
        let second = fx.runner.run(build(), params()).await.unwrap();

        assert!(second.is_success());
        let load = second.step("load").unwrap();
        assert_eq!(load.start_offset, 0);
        assert_eq!(load.read_count, 10);
        assert_eq!(values.lock().unwrap().len(), 13, "1..=3 twice, 4..=10 once");
    }

    #[tokio::test]
    async fn independent_step_resumes_after_an_earlier_step_reruns() {
        let fx = fixture(Config::default()).await;
        let armed = Arc::new(AtomicBool::new(true));
        let values = Arc::new(std::sync::Mutex::new(Vec::new()));
        let build = || {
            Job::builder("independent")
                .step(insert_step("prepare", vec![], 5, ScratchWriter::new()))
                .step(ChunkStep::new(
                    StepSettings::new("grant", 3),
                    VecSource::new((1..=10).collect()),
                    FnProcessor::new(|n: i64| Ok(Some(n))),
                    MemoryWriter {
                        values: values.clone(),
                        armed: armed.clone(),
                        fail_on: 5,
                    },
                ))
                .build()
                .unwrap()
        };

        let first = fx.runner.run(build(), params()).await.unwrap();
        assert_eq!(first.status, BatchStatus::Failed);

        armed.store(false, Ordering::SeqCst);
        let second = fx.runner.run(build(), params()).await.unwrap();

        assert!(second.is_success());
        assert_eq!(second.step("prepare").unwrap().status, BatchStatus::Completed);
        let grant = second.step("grant").unwrap();
        assert_eq!(grant.start_offset, 3);
        assert_eq!(grant.read_count, 7);
        assert_eq!(
            *values.lock().unwrap(),
            (1..=10).collect::<Vec<_>>(),
            "committed records are not written twice"
        );
    }

    #[tokio::test]
    async fn completed_step_without_restart_is_skipped() {
        let fx = fixture(Config::default()).await;
        let build = || {
            Job::builder("once")
                .step(ChunkStep::new(
                    StepSettings::new("only-once", 5).allow_restart_if_complete(false),
                    VecSource::new(vec![1, 2]),
                    FnProcessor::new(|n: i64| Ok(Some(n))),
                    ScratchWriter::new(),
                ))
                .build()
                .unwrap()
        };

        assert!(fx.runner.run(build(), params()).await.unwrap().is_success());
        let rerun = fx.runner.run(build(), params()).await.unwrap();

        assert!(rerun.is_success());
        assert!(rerun.steps.is_empty(), "nothing executed on re-run");
        assert_eq!(scratch_values(&fx.db).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn completed_instance_rerun_can_be_refused() {
        let mut config = Config::default();
        config.jobs.prevent_completed_rerun = true;
        let fx = fixture(config).await;
        let build = || {
            Job::builder("strict")
                .step(insert_step("s", vec![], 5, ScratchWriter::new()))
                .build()
                .unwrap()
        };

        fx.runner.run(build(), params()).await.unwrap();
        let err = fx.runner.run(build(), params()).await.unwrap_err();
        assert!(matches!(err, Error::JobRerunRefused { .. }));

        // different parameters are a different instance
        let other = JobParameters::new().with_string("run", "2");
        assert!(fx.runner.run(build(), other).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn started_execution_blocks_a_second_launch() {
        let fx = fixture(Config::default()).await;
        let instance = fx
            .db
            .find_or_create_job_instance("busy", &params().job_key())
            .await
            .unwrap();
        let running = fx.db.create_job_execution(instance, "{}").await.unwrap();
        fx.db
            .update_job_status(running, BatchStatus::Started)
            .await
            .unwrap();

        let job = Job::builder("busy")
            .step(insert_step("s", vec![1], 5, ScratchWriter::new()))
            .build()
            .unwrap();
        let err = fx.runner.run(job, params()).await.unwrap_err();
        assert!(matches!(err, Error::JobAlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn cancelled_runner_stops_before_first_step() {
        let fx = fixture(Config::default()).await;
        fx.runner.cancel.cancel();
        let job = Job::builder("cancelled")
            .step(insert_step("s", vec![1], 5, ScratchWriter::new()))
            .build()
            .unwrap();

        let execution = fx.runner.run(job, params()).await.unwrap();
        assert_eq!(execution.status, BatchStatus::Stopped);
        assert!(scratch_values(&fx.db).await.is_empty());
    }
}
