//! Error types for grade-batch
//!
//! Every fallible operation in the crate returns [`Result`]. The variants map onto the
//! failure scopes of the batch engine:
//! - launch-time problems ([`LaunchError`]) are raised before any execution row exists
//! - reference lookups that come back empty ([`Error::ReferenceNotFound`]) fail the step
//! - constraint violations while writing ([`Error::WriteConflict`]) roll back the chunk
//! - transient storage failures ([`Error::Transient`], busy/locked SQLite) are retried
//!   at the chunk commit boundary

use thiserror::Error;

/// Result type alias for grade-batch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for grade-batch
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "steps.update_grade.chunk_size")
        key: Option<String>,
    },

    /// Job parameters were missing or malformed at launch
    #[error("launch error: {0}")]
    Launch(#[from] LaunchError),

    /// A reference entity (coupon, grade, member) required by a processor does not exist
    #[error("{entity} not found: {key}")]
    ReferenceNotFound {
        /// Entity kind, e.g. "coupon"
        entity: &'static str,
        /// Lookup key that produced no row
        key: String,
    },

    /// A chunk write violated a uniqueness or integrity constraint
    #[error("write conflict: {0}")]
    WriteConflict(String),

    /// Temporary storage failure that may succeed on retry
    #[error("transient failure: {0}")]
    Transient(String),

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A processor rejected a record
    #[error("processing error: {0}")]
    Processing(String),

    /// A page source returned records that were not strictly ordered by their sort key
    #[error("ordering violation in {source_name}: key {key} follows {previous}")]
    Ordering {
        /// Name of the page source
        source_name: String,
        /// Key of the last accepted record
        previous: i64,
        /// Offending key
        key: i64,
    },

    /// The job instance already has a running execution
    #[error("job {job} is already running for parameters {job_key}")]
    JobAlreadyRunning {
        /// Job name
        job: String,
        /// Canonical parameter key of the instance
        job_key: String,
    },

    /// The job instance already completed and re-runs are disabled
    #[error("job {job} already completed for parameters {job_key}")]
    JobRerunRefused {
        /// Job name
        job: String,
        /// Canonical parameter key of the instance
        job_key: String,
    },

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a reference lookup miss
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Error::ReferenceNotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Classify an error raised by a chunk write statement
    ///
    /// Constraint violations become [`Error::WriteConflict`]; everything else stays a
    /// plain [`Error::Sqlx`] so that busy/locked failures remain retryable.
    pub fn from_write(error: sqlx::Error, context: &str) -> Self {
        let conflict = error.as_database_error().is_some_and(|db| {
            db.is_unique_violation() || db.is_foreign_key_violation() || db.is_check_violation()
        });

        if conflict {
            Error::WriteConflict(format!("{context}: {error}"))
        } else {
            Error::Sqlx(error)
        }
    }

    /// Whether a processor error may be skipped when the step has a skip limit
    ///
    /// Missing reference data and infrastructure failures are never skippable.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Error::Processing(_))
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Errors raised while binding job parameters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    /// A required parameter was not supplied
    #[error("missing required parameter '{0}'")]
    MissingParameter(String),

    /// A parameter could not be parsed into its declared type
    #[error("parameter '{name}' has invalid value '{value}': {reason}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// Raw value as supplied
        value: String,
        /// Why the value was rejected
        reason: String,
    },

    /// A parameter was read with a different type than it was bound with
    #[error("parameter '{name}' is not a {expected}")]
    TypeMismatch {
        /// Parameter name
        name: String,
        /// Requested type
        expected: &'static str,
    },
}
