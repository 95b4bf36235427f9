//! Chunk state machine.
//!
//! ```text
//! Idle -> Reading -> Processing -> Writing -> Committed -> Reading ...
//!            |            |            |
//!            |            +------------+--> Failed
//!            +--> StepComplete (nothing left to read)
//! Committed/Idle --(cancelled)--> Stopped
//! ```
//!
//! The writer call, the step progress update and the commit share one transaction, so
//! the committed read offset of a step always matches the data it wrote.

use crate::batch::reader::{PageSource, PagedReader};
use crate::batch::step::{StepContext, StepSettings};
use crate::batch::{ItemProcessor, ItemWriter};
use crate::db::{ChunkProgress, Database};
use crate::error::{Error, Result};
use crate::retry::with_retry;
use crate::types::{BatchStatus, Event};

/// Orchestrator state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkState {
    /// Nothing read yet
    Idle,
    /// Pulling records for the next chunk
    Reading,
    /// Running the processor over the chunk
    Processing,
    /// Writing and committing the chunk
    Writing,
    /// Last chunk committed
    Committed,
    /// A chunk failed; the step is over
    Failed,
    /// Cancelled at a chunk boundary
    Stopped,
    /// Source exhausted after the last commit
    StepComplete,
}

/// Counters of one step execution, updated after each commit
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepCounters {
    /// Records read in committed chunks
    pub read_count: u64,
    /// Rows written in committed chunks
    pub write_count: u64,
    /// Records filtered by the processor
    pub filter_count: u64,
    /// Records skipped after tolerated errors
    pub skip_count: u64,
    /// Committed chunks
    pub commit_count: u64,
    /// Rolled back chunks
    pub rollback_count: u64,
}

/// Result of a step that did not fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepOutcome {
    /// `Completed` or `Stopped`
    pub status: BatchStatus,
    /// Final counters
    pub counters: StepCounters,
}

/// Drives one step execution chunk by chunk
pub struct ChunkOrchestrator<'a, S, P, W>
where
    S: PageSource,
{
    settings: &'a StepSettings,
    reader: PagedReader<S>,
    processor: &'a P,
    writer: &'a W,
    ctx: &'a StepContext<'a>,
    state: ChunkState,
    counters: StepCounters,
}

impl<'a, S, P, W> ChunkOrchestrator<'a, S, P, W>
where
    S: PageSource,
    P: ItemProcessor<Input = S::Record>,
    W: ItemWriter<Item = P::Output>,
{
    /// Create an orchestrator over an opened reader
    pub fn new(
        settings: &'a StepSettings,
        reader: PagedReader<S>,
        processor: &'a P,
        writer: &'a W,
        ctx: &'a StepContext<'a>,
    ) -> Self {
        Self {
            settings,
            reader,
            processor,
            writer,
            ctx,
            state: ChunkState::Idle,
            counters: StepCounters::default(),
        }
    }

    /// Current state
    pub fn state(&self) -> ChunkState {
        self.state
    }

    /// Counters of committed work so far
    pub fn counters(&self) -> StepCounters {
        self.counters
    }

    /// Run chunks until the source is exhausted, a chunk fails, or cancellation
    pub async fn run(&mut self) -> Result<StepOutcome> {
        loop {
            if self.ctx.cancel.is_cancelled() {
                self.transition(ChunkState::Stopped);
                tracing::info!(
                    step = %self.settings.name,
                    commits = self.counters.commit_count,
                    "Step stopped at chunk boundary"
                );
                return Ok(self.outcome(BatchStatus::Stopped));
            }

            match self.run_chunk().await {
                Ok(true) => {}
                Ok(false) => {
                    self.transition(ChunkState::StepComplete);
                    return Ok(self.outcome(BatchStatus::Completed));
                }
                Err(e) => {
                    self.transition(ChunkState::Failed);
                    return Err(e);
                }
            }
        }
    }

    /// One pass through the state machine; `false` when there was nothing to read
    async fn run_chunk(&mut self) -> Result<bool> {
        self.transition(ChunkState::Reading);
        let inputs = self.read_chunk().await?;
        if inputs.is_empty() {
            return Ok(false);
        }

        self.transition(ChunkState::Processing);
        let (outputs, progress) = self.process_chunk(inputs).await?;

        self.transition(ChunkState::Writing);
        self.write_chunk(&outputs, progress).await?;

        self.transition(ChunkState::Committed);
        Ok(true)
    }

    async fn read_chunk(&mut self) -> Result<Vec<S::Record>> {
        let mut inputs = Vec::with_capacity(self.settings.chunk_size);
        while inputs.len() < self.settings.chunk_size {
            match self.reader.next().await? {
                Some(record) => inputs.push(record),
                None => break,
            }
        }
        Ok(inputs)
    }

    async fn process_chunk(
        &mut self,
        inputs: Vec<S::Record>,
    ) -> Result<(Vec<P::Output>, ChunkProgress)> {
        let mut progress = ChunkProgress {
            read: inputs.len() as u64,
            ..ChunkProgress::default()
        };
        let mut outputs = Vec::with_capacity(inputs.len());

        for input in inputs {
            match self.processor.process(input).await {
                Ok(Some(output)) => outputs.push(output),
                Ok(None) => progress.filtered += 1,
                Err(e)
                    if e.is_skippable()
                        && self.counters.skip_count + progress.skipped
                            < self.settings.skip_limit =>
                {
                    progress.skipped += 1;
                    tracing::warn!(
                        step = %self.settings.name,
                        error = %e,
                        skipped = self.counters.skip_count + progress.skipped,
                        skip_limit = self.settings.skip_limit,
                        "Skipping record after processing error"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        step = %self.settings.name,
                        error = %e,
                        "Processing failed, discarding chunk"
                    );
                    return Err(e);
                }
            }
        }

        Ok((outputs, progress))
    }

    async fn write_chunk(&mut self, outputs: &[P::Output], progress: ChunkProgress) -> Result<()> {
        let db = self.ctx.db;
        let writer = self.writer;
        let step_execution_id = self.ctx.step_execution_id;

        let result = with_retry(self.ctx.retry, || async move {
            let mut tx = db.pool().begin().await?;
            let written = if outputs.is_empty() {
                0
            } else {
                writer.write(&mut tx, outputs).await?
            };
            let committed = ChunkProgress {
                written,
                ..progress
            };
            Database::record_chunk_commit(&mut tx, step_execution_id, &committed).await?;
            tx.commit().await?;
            Ok::<ChunkProgress, Error>(committed)
        })
        .await;

        match result {
            Ok(committed) => {
                self.counters.read_count += committed.read;
                self.counters.write_count += committed.written;
                self.counters.filter_count += committed.filtered;
                self.counters.skip_count += committed.skipped;
                self.counters.commit_count += 1;

                tracing::debug!(
                    step = %self.settings.name,
                    chunk = self.counters.commit_count,
                    read = committed.read,
                    written = committed.written,
                    filtered = committed.filtered,
                    "Chunk committed"
                );
                let _ = self.ctx.events.send(Event::ChunkCommitted {
                    execution_id: self.ctx.job_execution_id,
                    step: self.settings.name.clone(),
                    chunk: self.counters.commit_count,
                    read: committed.read,
                    written: committed.written,
                });
                Ok(())
            }
            Err(e) => {
                self.counters.rollback_count += 1;
                tracing::error!(
                    step = %self.settings.name,
                    error = %e,
                    records = outputs.len(),
                    "Chunk write failed, rolled back"
                );
                if let Err(record_err) = db.record_rollback(step_execution_id).await {
                    tracing::warn!(error = %record_err, "Failed to record chunk rollback");
                }
                Err(e)
            }
        }
    }

    fn transition(&mut self, next: ChunkState) {
        tracing::trace!(step = %self.settings.name, from = ?self.state, to = ?next, "Chunk state");
        self.state = next;
    }

    fn outcome(&self, status: BatchStatus) -> StepOutcome {
        StepOutcome {
            status,
            counters: self.counters,
        }
    }
}
