//! Steps: a reader, a processor and a writer bound to a chunk size.

use crate::batch::orchestrator::{ChunkOrchestrator, StepOutcome};
use crate::batch::reader::{PageSource, PagedReader};
use crate::batch::{ItemProcessor, ItemWriter};
use crate::config::{MAX_CHUNK_SIZE, RetryConfig, StepConfig};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{Event, JobExecutionId, StepExecutionId};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Everything a step needs from the job runner for one execution
pub struct StepContext<'a> {
    /// Database handle; chunk transactions are opened on its pool
    pub db: &'a Database,
    /// Owning job execution
    pub job_execution_id: JobExecutionId,
    /// Execution row whose counters the chunks update
    pub step_execution_id: StepExecutionId,
    /// Records to skip because an earlier execution committed them
    pub start_offset: u64,
    /// Commit retry policy
    pub retry: &'a RetryConfig,
    /// Checked between chunks
    pub cancel: &'a CancellationToken,
    /// Event channel
    pub events: &'a broadcast::Sender<Event>,
}

/// Sizing and policy of a step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepSettings {
    /// Step name, unique within a job
    pub name: String,
    /// Processed records per transaction
    pub chunk_size: usize,
    /// Records per page round-trip
    pub page_size: usize,
    /// Run again even if the instance already completed this step
    pub allow_restart_if_complete: bool,
    /// A failure of this step fails the job
    pub critical: bool,
    /// Processing errors tolerated before the step fails
    pub skip_limit: u64,
    /// Start over instead of resuming when an earlier step re-ran in the same execution
    pub restart_with_upstream: bool,
}

impl StepSettings {
    /// Critical, restartable step with `page_size == chunk_size` and no skips
    pub fn new(name: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            name: name.into(),
            chunk_size,
            page_size: chunk_size,
            allow_restart_if_complete: true,
            critical: true,
            skip_limit: 0,
            restart_with_upstream: false,
        }
    }

    /// Settings taken from a step's configuration block
    pub fn from_config(name: impl Into<String>, config: &StepConfig) -> Self {
        Self {
            page_size: config.page_size(),
            allow_restart_if_complete: config.allow_restart_if_complete,
            skip_limit: config.skip_limit,
            ..Self::new(name, config.chunk_size)
        }
    }

    /// Override the page size
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the skip limit
    pub fn skip_limit(mut self, skip_limit: u64) -> Self {
        self.skip_limit = skip_limit;
        self
    }

    /// Set whether a completed step runs again on re-launch
    pub fn allow_restart_if_complete(mut self, allow: bool) -> Self {
        self.allow_restart_if_complete = allow;
        self
    }

    /// Start over whenever an earlier step of the same execution re-ran after completing
    ///
    /// For steps that read rows an earlier step rewrites; their committed offset no
    /// longer points into the same data.
    pub fn restart_with_upstream(mut self) -> Self {
        self.restart_with_upstream = true;
        self
    }

    /// Reject sizes the orchestrator cannot run with
    ///
    /// A zero chunk would read nothing and report the step complete; chunks above
    /// [`MAX_CHUNK_SIZE`] exceed SQLite's bind limit in the bulk writers.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Config {
                message: format!(
                    "step {}: chunk size {} must be between 1 and {MAX_CHUNK_SIZE}",
                    self.name, self.chunk_size
                ),
                key: Some("chunk_size".to_string()),
            });
        }
        Ok(())
    }

    /// Let the job continue when this step fails
    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }
}

/// A unit of work the job runner executes in order
#[async_trait]
pub trait Step: Send + Sync {
    /// Step name, unique within a job
    fn name(&self) -> &str;

    /// Run again even if the instance already completed this step
    fn allow_restart_if_complete(&self) -> bool;

    /// Whether a failure of this step fails the job
    fn is_critical(&self) -> bool;

    /// Whether the step starts over after an earlier step re-ran
    fn restarts_with_upstream(&self) -> bool {
        false
    }

    /// Execute the step to completion, cancellation or failure
    async fn execute(&mut self, ctx: &StepContext<'_>) -> Result<StepOutcome>;
}

/// The chunk-oriented step
pub struct ChunkStep<S, P, W> {
    settings: StepSettings,
    source: Arc<S>,
    processor: P,
    writer: W,
}

impl<S, P, W> ChunkStep<S, P, W>
where
    S: PageSource,
    P: ItemProcessor<Input = S::Record>,
    W: ItemWriter<Item = P::Output>,
{
    /// Bind a reader source, a processor and a writer
    pub fn new(settings: StepSettings, source: S, processor: P, writer: W) -> Self {
        Self {
            settings,
            source: Arc::new(source),
            processor,
            writer,
        }
    }

    /// Step settings
    pub fn settings(&self) -> &StepSettings {
        &self.settings
    }
}

#[async_trait]
impl<S, P, W> Step for ChunkStep<S, P, W>
where
    S: PageSource + 'static,
    P: ItemProcessor<Input = S::Record> + 'static,
    W: ItemWriter<Item = P::Output> + 'static,
{
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn allow_restart_if_complete(&self) -> bool {
        self.settings.allow_restart_if_complete
    }

    fn is_critical(&self) -> bool {
        self.settings.critical
    }

    fn restarts_with_upstream(&self) -> bool {
        self.settings.restart_with_upstream
    }

    async fn execute(&mut self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        self.settings.validate()?;
        self.processor.open().await?;

        let reader = PagedReader::open(
            Arc::clone(&self.source),
            self.settings.page_size,
            ctx.start_offset,
        )?;

        tracing::debug!(
            step = %self.settings.name,
            source = self.source.name(),
            chunk_size = self.settings.chunk_size,
            page_size = self.settings.page_size,
            write_mode = ?self.writer.mode(),
            start_offset = ctx.start_offset,
            "Executing chunk step"
        );

        let mut orchestrator =
            ChunkOrchestrator::new(&self.settings, reader, &self.processor, &self.writer, ctx);
        orchestrator.run().await
    }
}
