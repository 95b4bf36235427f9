//! Job repository: instances, executions and per-step progress.
//!
//! Chunk progress is written through [`Database::record_chunk_commit`] on the chunk's
//! own transaction, so the committed offset always matches the committed data.

use crate::error::DatabaseError;
use crate::types::{BatchStatus, JobExecutionId, JobInstanceId, StepExecutionId};
use crate::{Error, Result};
use sqlx::SqliteConnection;

use super::{Database, JobExecutionRow, StepExecutionRow};

const JOB_EXECUTION_COLUMNS: &str = r#"
    je.id, je.job_instance_id, ji.job_name, je.status, je.parameters,
    je.started_at, je.ended_at, je.exit_message
"#;

const STEP_EXECUTION_COLUMNS: &str = r#"
    se.id, se.job_execution_id, se.step_name, se.status, se.start_offset,
    se.read_count, se.write_count, se.filter_count, se.skip_count,
    se.commit_count, se.rollback_count, se.started_at, se.ended_at, se.exit_message
"#;

/// Counter increments of one committed chunk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChunkProgress {
    /// Records read
    pub read: u64,
    /// Records written
    pub written: u64,
    /// Records filtered out
    pub filtered: u64,
    /// Records skipped after tolerated errors
    pub skipped: u64,
}

impl Database {
    /// Find the instance for `(job_name, job_key)`, creating it on first launch
    pub async fn find_or_create_job_instance(
        &self,
        job_name: &str,
        job_key: &str,
    ) -> Result<JobInstanceId> {
        sqlx::query(
            r#"
            INSERT INTO job_instances (job_name, job_key, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(job_name, job_key) DO NOTHING
            "#,
        )
        .bind(job_name)
        .bind(job_key)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to create job instance: {}",
                e
            )))
        })?;

        let id: i64 =
            sqlx::query_scalar("SELECT id FROM job_instances WHERE job_name = ? AND job_key = ?")
                .bind(job_name)
                .bind(job_key)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to load job instance: {}",
                        e
                    )))
                })?;

        Ok(JobInstanceId(id))
    }

    /// Create a job execution in STARTING state
    pub async fn create_job_execution(
        &self,
        instance: JobInstanceId,
        parameters_json: &str,
    ) -> Result<JobExecutionId> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_executions (job_instance_id, status, parameters, started_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(instance.0)
        .bind(BatchStatus::Starting.to_i32())
        .bind(parameters_json)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to create job execution: {}",
                e
            )))
        })?;

        Ok(JobExecutionId(result.last_insert_rowid()))
    }

    /// Move a running job execution to a new non-terminal status
    pub async fn update_job_status(&self, id: JobExecutionId, status: BatchStatus) -> Result<()> {
        sqlx::query("UPDATE job_executions SET status = ? WHERE id = ?")
            .bind(status.to_i32())
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to update job status: {}",
                    e
                )))
            })?;
        Ok(())
    }

    /// Record the terminal status of a job execution
    pub async fn finish_job_execution(
        &self,
        id: JobExecutionId,
        status: BatchStatus,
        exit_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE job_executions SET status = ?, ended_at = ?, exit_message = ? WHERE id = ?",
        )
        .bind(status.to_i32())
        .bind(chrono::Utc::now().timestamp())
        .bind(exit_message)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to finish job execution: {}",
                e
            )))
        })?;
        Ok(())
    }

    /// Get a job execution by ID
    pub async fn get_job_execution(&self, id: JobExecutionId) -> Result<Option<JobExecutionRow>> {
        let sql = format!(
            r#"
            SELECT {JOB_EXECUTION_COLUMNS}
            FROM job_executions je
            JOIN job_instances ji ON ji.id = je.job_instance_id
            WHERE je.id = ?
            "#
        );

        sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Sqlx)
    }

    /// Most recent execution of a job instance
    pub async fn last_job_execution(
        &self,
        instance: JobInstanceId,
    ) -> Result<Option<JobExecutionRow>> {
        let sql = format!(
            r#"
            SELECT {JOB_EXECUTION_COLUMNS}
            FROM job_executions je
            JOIN job_instances ji ON ji.id = je.job_instance_id
            WHERE je.job_instance_id = ?
            ORDER BY je.id DESC
            LIMIT 1
            "#
        );

        sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(instance.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Sqlx)
    }

    /// Executions of a job by name, newest first
    pub async fn list_job_executions(
        &self,
        job_name: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobExecutionRow>> {
        let sql = format!(
            r#"
            SELECT {JOB_EXECUTION_COLUMNS}
            FROM job_executions je
            JOIN job_instances ji ON ji.id = je.job_instance_id
            WHERE ji.job_name = ?
            ORDER BY je.id DESC
            LIMIT ? OFFSET ?
            "#
        );

        sqlx::query_as::<_, JobExecutionRow>(&sql)
            .bind(job_name)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Sqlx)
    }

    /// Create a step execution in STARTED state
    pub async fn create_step_execution(
        &self,
        job_execution: JobExecutionId,
        step_name: &str,
        start_offset: u64,
    ) -> Result<StepExecutionId> {
        let result = sqlx::query(
            r#"
            INSERT INTO step_executions (job_execution_id, step_name, status, start_offset, started_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_execution.0)
        .bind(step_name)
        .bind(BatchStatus::Started.to_i32())
        .bind(start_offset as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to create step execution: {}",
                e
            )))
        })?;

        Ok(StepExecutionId(result.last_insert_rowid()))
    }

    /// Add a committed chunk's counters to a step execution
    ///
    /// Runs on the chunk transaction's connection; the caller commits.
    pub async fn record_chunk_commit(
        conn: &mut SqliteConnection,
        id: StepExecutionId,
        progress: &ChunkProgress,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE step_executions SET
                read_count = read_count + ?,
                write_count = write_count + ?,
                filter_count = filter_count + ?,
                skip_count = skip_count + ?,
                commit_count = commit_count + 1
            WHERE id = ?
            "#,
        )
        .bind(progress.read as i64)
        .bind(progress.written as i64)
        .bind(progress.filtered as i64)
        .bind(progress.skipped as i64)
        .bind(id.0)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Database(DatabaseError::NotFound(format!(
                "step execution {}",
                id
            ))));
        }
        Ok(())
    }

    /// Count a rolled back chunk
    pub async fn record_rollback(&self, id: StepExecutionId) -> Result<()> {
        sqlx::query("UPDATE step_executions SET rollback_count = rollback_count + 1 WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to record rollback: {}",
                    e
                )))
            })?;
        Ok(())
    }

    /// Record the terminal status of a step execution
    pub async fn finish_step_execution(
        &self,
        id: StepExecutionId,
        status: BatchStatus,
        exit_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE step_executions SET status = ?, ended_at = ?, exit_message = ? WHERE id = ?",
        )
        .bind(status.to_i32())
        .bind(chrono::Utc::now().timestamp())
        .bind(exit_message)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to finish step execution: {}",
                e
            )))
        })?;
        Ok(())
    }

    /// Get a step execution by ID
    pub async fn get_step_execution(&self, id: StepExecutionId) -> Result<Option<StepExecutionRow>> {
        let sql = format!("SELECT {STEP_EXECUTION_COLUMNS} FROM step_executions se WHERE se.id = ?");

        sqlx::query_as::<_, StepExecutionRow>(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Sqlx)
    }

    /// Most recent execution of a step across all executions of a job instance
    pub async fn last_step_execution(
        &self,
        instance: JobInstanceId,
        step_name: &str,
    ) -> Result<Option<StepExecutionRow>> {
        let sql = format!(
            r#"
            SELECT {STEP_EXECUTION_COLUMNS}
            FROM step_executions se
            JOIN job_executions je ON je.id = se.job_execution_id
            WHERE je.job_instance_id = ? AND se.step_name = ?
            ORDER BY se.id DESC
            LIMIT 1
            "#
        );

        sqlx::query_as::<_, StepExecutionRow>(&sql)
            .bind(instance.0)
            .bind(step_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Sqlx)
    }

    /// Step executions of a job execution, in execution order
    pub async fn step_executions_for(
        &self,
        job_execution: JobExecutionId,
    ) -> Result<Vec<StepExecutionRow>> {
        let sql = format!(
            r#"
            SELECT {STEP_EXECUTION_COLUMNS}
            FROM step_executions se
            WHERE se.job_execution_id = ?
            ORDER BY se.id ASC
            "#
        );

        sqlx::query_as::<_, StepExecutionRow>(&sql)
            .bind(job_execution.0)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Sqlx)
    }

    /// Mark executions left running by a previous process as failed
    ///
    /// Called once on service start. Returns the number of job executions recovered.
    pub async fn mark_abandoned_executions(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();
        let running = [BatchStatus::Starting.to_i32(), BatchStatus::Started.to_i32()];

        sqlx::query(
            r#"
            UPDATE step_executions
            SET status = ?, ended_at = ?, exit_message = 'abandoned: process exited while running'
            WHERE status = ?
            "#,
        )
        .bind(BatchStatus::Failed.to_i32())
        .bind(now)
        .bind(BatchStatus::Started.to_i32())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to recover abandoned steps: {}",
                e
            )))
        })?;

        let result = sqlx::query(
            r#"
            UPDATE job_executions
            SET status = ?, ended_at = ?, exit_message = 'abandoned: process exited while running'
            WHERE status IN (?, ?)
            "#,
        )
        .bind(BatchStatus::Failed.to_i32())
        .bind(now)
        .bind(running[0])
        .bind(running[1])
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to recover abandoned jobs: {}",
                e
            )))
        })?;

        Ok(result.rows_affected())
    }
}
