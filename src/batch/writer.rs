//! Chunk persistence.

use crate::error::Result;
use async_trait::async_trait;
use sqlx::SqliteConnection;

/// How a writer persists its records
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// New rows (coupon grants)
    Insert,
    /// Update of existing rows by key (grade changes)
    Update,
}

/// Persists one chunk of processed records
///
/// `write` runs on the connection of the transaction the orchestrator opened for the
/// chunk and must not commit or roll back itself. Any error rolls back the whole chunk.
#[async_trait]
pub trait ItemWriter: Send + Sync {
    /// Record type accepted by the writer
    type Item: Send + Sync + 'static;

    /// Insert or update semantics
    fn mode(&self) -> WriteMode;

    /// Write a non-empty chunk; returns the number of rows affected
    async fn write(&self, conn: &mut SqliteConnection, chunk: &[Self::Item]) -> Result<u64>;
}
