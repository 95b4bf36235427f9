//! Database lifecycle and schema migrations.

use crate::error::DatabaseError;
use crate::{Error, Result};
use sqlx::SqliteConnection;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use super::Database;

/// Batch execution metadata
const V1_EXECUTION_SCHEMA: &[(&str, &str)] = &[
    (
        "job_instances table",
        r#"
        CREATE TABLE job_instances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_name TEXT NOT NULL,
            job_key TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(job_name, job_key)
        )
        "#,
    ),
    (
        "job_executions table",
        r#"
        CREATE TABLE job_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_instance_id INTEGER NOT NULL REFERENCES job_instances(id),
            status INTEGER NOT NULL,
            parameters TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            exit_message TEXT
        )
        "#,
    ),
    (
        "job_executions index",
        "CREATE INDEX idx_job_executions_instance ON job_executions(job_instance_id, id)",
    ),
    (
        "step_executions table",
        r#"
        CREATE TABLE step_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_execution_id INTEGER NOT NULL REFERENCES job_executions(id),
            step_name TEXT NOT NULL,
            status INTEGER NOT NULL,
            start_offset INTEGER NOT NULL DEFAULT 0,
            read_count INTEGER NOT NULL DEFAULT 0,
            write_count INTEGER NOT NULL DEFAULT 0,
            filter_count INTEGER NOT NULL DEFAULT 0,
            skip_count INTEGER NOT NULL DEFAULT 0,
            commit_count INTEGER NOT NULL DEFAULT 0,
            rollback_count INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            exit_message TEXT
        )
        "#,
    ),
    (
        "step_executions index",
        "CREATE INDEX idx_step_executions_job ON step_executions(job_execution_id, step_name)",
    ),
];

/// Membership tables
const V2_MEMBERSHIP_SCHEMA: &[(&str, &str)] = &[
    (
        "member_grades table",
        r#"
        CREATE TABLE member_grades (
            member_grade_no INTEGER PRIMARY KEY,
            grade TEXT NOT NULL UNIQUE
        )
        "#,
    ),
    (
        "member_grades seed",
        "INSERT INTO member_grades (member_grade_no, grade) VALUES (1, 'GVIP'), (2, 'VIP'), (3, 'MEMBER')",
    ),
    (
        "members table",
        r#"
        CREATE TABLE members (
            member_no INTEGER PRIMARY KEY AUTOINCREMENT,
            member_grade_no INTEGER NOT NULL REFERENCES member_grades(member_grade_no),
            uuid TEXT NOT NULL UNIQUE,
            gender TEXT,
            birth_date TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            deleted_at INTEGER
        )
        "#,
    ),
    (
        "members grade index",
        "CREATE INDEX idx_members_grade ON members(member_grade_no, member_no)",
    ),
    (
        "coupons table",
        r#"
        CREATE TABLE coupons (
            coupon_no INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            expired_date INTEGER NOT NULL,
            minimum_money INTEGER NOT NULL,
            discount_amount REAL NOT NULL
        )
        "#,
    ),
    ("coupons name index", "CREATE INDEX idx_coupons_name ON coupons(name)"),
    (
        "given_coupons table",
        r#"
        CREATE TABLE given_coupons (
            coupon_no INTEGER NOT NULL REFERENCES coupons(coupon_no),
            member_no INTEGER NOT NULL REFERENCES members(member_no),
            created_at INTEGER NOT NULL,
            PRIMARY KEY (coupon_no, member_no)
        )
        "#,
    ),
    (
        "orders table",
        r#"
        CREATE TABLE orders (
            order_no INTEGER PRIMARY KEY AUTOINCREMENT,
            member_no INTEGER NOT NULL REFERENCES members(member_no),
            total_amount INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    ),
    (
        "orders window index",
        "CREATE INDEX idx_orders_created ON orders(created_at, member_no)",
    ),
];

impl Database {
    /// Create a new database connection
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to create database directory: {}",
                    e
                )))
            })?;
        }

        // Connect to database with foreign key enforcement and WAL mode
        use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| {
                Error::Database(DatabaseError::ConnectionFailed(format!(
                    "Failed to parse database path: {}",
                    e
                )))
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to connect to database: {}",
                e
            )))
        })?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            Error::Database(DatabaseError::ConnectionFailed(format!(
                "Failed to acquire connection: {}",
                e
            )))
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::MigrationFailed(format!(
                "Failed to create schema_version table: {}",
                e
            )))
        })?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    Error::Database(DatabaseError::QueryFailed(format!(
                        "Failed to query schema version: {}",
                        e
                    )))
                })?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        if current_version < 1 {
            Self::apply_migration(&mut conn, 1, V1_EXECUTION_SCHEMA).await?;
        }
        if current_version < 2 {
            Self::apply_migration(&mut conn, 2, V2_MEMBERSHIP_SCHEMA).await?;
        }

        Ok(())
    }

    /// Apply one schema version inside a transaction
    async fn apply_migration(
        conn: &mut SqliteConnection,
        version: i64,
        statements: &[(&str, &str)],
    ) -> Result<()> {
        tracing::info!(version, "Applying database migration");

        // Partial failures must not leave the DB in a broken state
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to begin transaction: {}",
                    e
                )))
            })?;

        let result = async {
            for (what, sql) in statements {
                sqlx::query(sql).execute(&mut *conn).await.map_err(|e| {
                    Error::Database(DatabaseError::MigrationFailed(format!(
                        "Failed to create {}: {}",
                        what, e
                    )))
                })?;
            }
            Self::record_migration(conn, version).await?;
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| {
                        Error::Database(DatabaseError::MigrationFailed(format!(
                            "Failed to commit migration v{}: {}",
                            version, e
                        )))
                    })?;
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        tracing::info!(version, "Database migration complete");
        Ok(())
    }

    /// Record migration version
    async fn record_migration(conn: &mut SqliteConnection, version: i64) -> Result<()> {
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::MigrationFailed(format!(
                    "Failed to record migration v{}: {}",
                    version, e
                )))
            })?;
        Ok(())
    }

    /// Close the database connection
    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
