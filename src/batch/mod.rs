//! Chunked batch engine
//!
//! A [`Job`] is an ordered list of [`Step`]s. A [`ChunkStep`] pulls records through a
//! [`PagedReader`], transforms them with an [`ItemProcessor`] and hands full chunks to
//! an [`ItemWriter`]; the [`ChunkOrchestrator`] commits each chunk in its own
//! transaction together with the step's progress. The [`JobRunner`] records every
//! execution so that a failed job resumes after its last committed chunk.
//!
//! ## Submodules
//!
//! - [`reader`]: keyset paging over a [`PageSource`]
//! - [`processor`]: per-record transformation and filtering
//! - [`writer`]: bulk chunk persistence
//! - [`orchestrator`]: the chunk state machine
//! - [`step`]: step settings and the [`Step`] trait
//! - [`job`]: jobs, restart rules and the runner
//! - [`params`]: typed, immutable launch parameters

pub mod job;
pub mod orchestrator;
pub mod params;
pub mod processor;
pub mod reader;
pub mod step;
pub mod writer;

pub use job::{Job, JobBuilder, JobRunner};
pub use orchestrator::{ChunkOrchestrator, ChunkState, StepCounters, StepOutcome};
pub use params::{JobParameters, ParamDef, ParamKind, ParamValue};
pub use processor::{FnProcessor, ItemProcessor};
pub use reader::{PageRequest, PageSource, PagedReader};
pub use step::{ChunkStep, Step, StepContext, StepSettings};
pub use writer::{ItemWriter, WriteMode};

/// In-memory sources and scratch-table writers for engine tests
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::RetryConfig;
    use crate::db::{Database, StepExecutionRow};
    use crate::error::{Error, Result};
    use crate::types::{Event, JobExecutionId, StepExecutionId};
    use async_trait::async_trait;
    use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    /// Page source over a vector of keys; the record is its own key
    pub struct VecSource {
        records: Vec<i64>,
        requests: Mutex<Vec<PageRequest>>,
    }

    impl VecSource {
        pub fn new(mut records: Vec<i64>) -> Self {
            records.sort_unstable();
            records.dedup();
            Self::unchecked(records)
        }

        /// Keeps the given order, even if it is not sorted
        pub fn unchecked(records: Vec<i64>) -> Self {
            Self {
                records,
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn requests(&self) -> Vec<PageRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for VecSource {
        type Record = i64;

        fn name(&self) -> &str {
            "vec"
        }

        fn sort_key(&self, record: &i64) -> i64 {
            *record
        }

        async fn fetch_page(&self, request: PageRequest) -> Result<Vec<i64>> {
            self.requests.lock().unwrap().push(request);
            Ok(self
                .records
                .iter()
                .copied()
                .filter(|key| *key > request.after_key())
                .skip(request.offset as usize)
                .take(request.limit as usize)
                .collect())
        }
    }

    /// Writes values into `scratch_items`, with failure injection
    pub struct ScratchWriter {
        fail_on: Option<i64>,
        transient_failures: AtomicU32,
        cancel_after_first_chunk: Option<CancellationToken>,
        calls: Mutex<Vec<Vec<i64>>>,
    }

    impl ScratchWriter {
        pub fn new() -> Self {
            Self {
                fail_on: None,
                transient_failures: AtomicU32::new(0),
                cancel_after_first_chunk: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Fail (after inserting) any chunk containing `value`
        pub fn fail_on(mut self, value: i64) -> Self {
            self.fail_on = Some(value);
            self
        }

        /// Fail the first `n` attempts with a retryable error
        pub fn transient_failures(self, n: u32) -> Self {
            self.transient_failures.store(n, Ordering::SeqCst);
            self
        }

        pub fn cancel_after_first_chunk(mut self, token: CancellationToken) -> Self {
            self.cancel_after_first_chunk = Some(token);
            self
        }

        /// Chunk length of every write attempt
        pub fn chunk_sizes(&self) -> Vec<usize> {
            self.calls.lock().unwrap().iter().map(Vec::len).collect()
        }

        /// Every value handed to the writer
        pub fn written(&self) -> Vec<i64> {
            self.calls.lock().unwrap().iter().flatten().copied().collect()
        }
    }

    #[async_trait]
    impl ItemWriter for ScratchWriter {
        type Item = i64;

        fn mode(&self) -> WriteMode {
            WriteMode::Insert
        }

        async fn write(&self, conn: &mut SqliteConnection, chunk: &[i64]) -> Result<u64> {
            self.calls.lock().unwrap().push(chunk.to_vec());

            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Transient("injected busy".into()));
            }

            let mut query_builder = QueryBuilder::<Sqlite>::new("INSERT INTO scratch_items (value) ");
            query_builder.push_values(chunk, |mut b, value| {
                b.push_bind(*value);
            });
            let result = query_builder
                .build()
                .execute(&mut *conn)
                .await
                .map_err(|e| Error::from_write(e, "scratch insert"))?;

            if let Some(fail_on) = self.fail_on
                && chunk.contains(&fail_on)
            {
                return Err(Error::WriteConflict(format!("injected failure on {fail_on}")));
            }
            if let Some(token) = &self.cancel_after_first_chunk {
                token.cancel();
            }
            Ok(result.rows_affected())
        }
    }

    /// Temporary database with one running job and step execution
    pub struct Harness {
        pub db: Database,
        pub retry: RetryConfig,
        pub cancel: CancellationToken,
        pub events: broadcast::Sender<Event>,
        pub job_execution_id: JobExecutionId,
        pub step_execution_id: StepExecutionId,
        pub start_offset: u64,
        _file: NamedTempFile,
    }

    impl Harness {
        pub async fn new() -> Self {
            Self::with_start_offset(0).await
        }

        pub async fn with_start_offset(start_offset: u64) -> Self {
            let file = NamedTempFile::new().unwrap();
            let db = Database::new(file.path()).await.unwrap();
            sqlx::query("CREATE TABLE scratch_items (value INTEGER PRIMARY KEY)")
                .execute(db.pool())
                .await
                .unwrap();

            let instance = db
                .find_or_create_job_instance("harness", "run=1")
                .await
                .unwrap();
            let job_execution_id = db.create_job_execution(instance, "{}").await.unwrap();
            let step_execution_id = db
                .create_step_execution(job_execution_id, "harness_step", start_offset)
                .await
                .unwrap();
            let (events, _) = broadcast::channel(64);

            Self {
                db,
                retry: fast_retry(),
                cancel: CancellationToken::new(),
                events,
                job_execution_id,
                step_execution_id,
                start_offset,
                _file: file,
            }
        }

        pub fn step_context(&self) -> StepContext<'_> {
            StepContext {
                db: &self.db,
                job_execution_id: self.job_execution_id,
                step_execution_id: self.step_execution_id,
                start_offset: self.start_offset,
                retry: &self.retry,
                cancel: &self.cancel,
                events: &self.events,
            }
        }

        pub async fn scratch_values(&self) -> Vec<i64> {
            scratch_values(&self.db).await
        }

        pub async fn step_row(&self) -> StepExecutionRow {
            self.db
                .get_step_execution(self.step_execution_id)
                .await
                .unwrap()
                .unwrap()
        }
    }

    pub fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    pub async fn scratch_values(db: &Database) -> Vec<i64> {
        sqlx::query_scalar("SELECT value FROM scratch_items ORDER BY value")
            .fetch_all(db.pool())
            .await
            .unwrap()
    }
}
