//! Core types for grade-batch

use serde::{Deserialize, Serialize};

macro_rules! execution_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Get the inner i64 value
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

execution_id!(
    /// Unique identifier of a job instance (job name + parameter key)
    JobInstanceId
);
execution_id!(
    /// Unique identifier of one run of a job instance
    JobExecutionId
);
execution_id!(
    /// Unique identifier of one run of a step
    StepExecutionId
);

/// Lifecycle status shared by job and step executions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Execution row created, not yet running
    Starting,
    /// Running
    Started,
    /// Finished successfully
    Completed,
    /// Finished with an error, or abandoned by a crashed process
    Failed,
    /// Cancelled at a chunk boundary
    Stopped,
}

impl BatchStatus {
    /// Convert integer status code to BatchStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => BatchStatus::Starting,
            1 => BatchStatus::Started,
            2 => BatchStatus::Completed,
            3 => BatchStatus::Failed,
            4 => BatchStatus::Stopped,
            _ => BatchStatus::Failed,
        }
    }

    /// Convert BatchStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            BatchStatus::Starting => 0,
            BatchStatus::Started => 1,
            BatchStatus::Completed => 2,
            BatchStatus::Failed => 3,
            BatchStatus::Stopped => 4,
        }
    }

    /// Whether an execution in this state is still (or was last seen) running
    pub fn is_running(&self) -> bool {
        matches!(self, BatchStatus::Starting | BatchStatus::Started)
    }

    /// Whether a new execution should resume where this one left off
    pub fn is_resumable(&self) -> bool {
        matches!(self, BatchStatus::Failed | BatchStatus::Stopped)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Outcome of one step execution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExecution {
    /// Step execution ID
    pub id: StepExecutionId,
    /// Step name
    pub step_name: String,
    /// Final (or current) status
    pub status: BatchStatus,
    /// Records skipped at open because an earlier execution committed them
    pub start_offset: u64,
    /// Records read in committed chunks
    pub read_count: u64,
    /// Records written in committed chunks
    pub write_count: u64,
    /// Records the processor filtered out
    pub filter_count: u64,
    /// Records skipped after a tolerated processing error
    pub skip_count: u64,
    /// Committed chunks
    pub commit_count: u64,
    /// Rolled back chunks
    pub rollback_count: u64,
    /// Failure description
    pub exit_message: Option<String>,
}

/// Outcome of one job execution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecution {
    /// Job execution ID
    pub id: JobExecutionId,
    /// Job instance this execution belongs to
    pub instance_id: JobInstanceId,
    /// Job name
    pub job_name: String,
    /// Final (or current) status
    pub status: BatchStatus,
    /// Failure description
    pub exit_message: Option<String>,
    /// Steps executed by this run, in order
    pub steps: Vec<StepExecution>,
}

impl JobExecution {
    /// Whether the job completed
    pub fn is_success(&self) -> bool {
        self.status == BatchStatus::Completed
    }

    /// Step execution by name
    pub fn step(&self, name: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_name == name)
    }
}

/// Event emitted during the batch lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A job execution began
    JobStarted {
        /// Job execution ID
        execution_id: JobExecutionId,
        /// Job name
        job: String,
        /// Canonical parameter key
        job_key: String,
    },

    /// A step began
    StepStarted {
        /// Job execution ID
        execution_id: JobExecutionId,
        /// Step name
        step: String,
        /// Records skipped because an earlier execution committed them
        start_offset: u64,
    },

    /// A chunk was committed
    ChunkCommitted {
        /// Job execution ID
        execution_id: JobExecutionId,
        /// Step name
        step: String,
        /// Commit number within this step execution (1-based)
        chunk: u64,
        /// Records read in this chunk
        read: u64,
        /// Records written in this chunk
        written: u64,
    },

    /// A step finished without error
    StepCompleted {
        /// Job execution ID
        execution_id: JobExecutionId,
        /// Step name
        step: String,
        /// Final status (completed or stopped)
        status: BatchStatus,
        /// Records written by this execution
        write_count: u64,
    },

    /// A step was skipped because it already completed for this instance
    StepSkipped {
        /// Job execution ID
        execution_id: JobExecutionId,
        /// Step name
        step: String,
    },

    /// A step failed
    StepFailed {
        /// Job execution ID
        execution_id: JobExecutionId,
        /// Step name
        step: String,
        /// Error message
        error: String,
    },

    /// A job execution reached a terminal status
    JobFinished {
        /// Job execution ID
        execution_id: JobExecutionId,
        /// Job name
        job: String,
        /// Terminal status
        status: BatchStatus,
    },

    /// Service is shutting down
    Shutdown,
}
