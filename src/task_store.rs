// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable replication queue in SQLite.
//!
//! One row per [`ReplicationTask`], keyed by `task_id`. Completion deletes the
//! row, so completing twice (or completing an id that never existed) is a
//! no-op and re-delivery after a crash simply re-reads the row.
//!
//! ```text
//! append(task 1444) → get_tasks(after 1443) → process → complete_task(1444)
//!                                                      (crash here = re-read, idempotent)
//! ```
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Every statement is retried with exponential backoff, up to
//! five attempts.

use crate::config::TaskStoreConfig;
use crate::error::{ReplicationError, Result};
use crate::store::{TaskFuture, TaskStore};
use crate::task::{ReplicationTask, ReplicationTaskType};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::task_store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn task_from_row(row: &SqliteRow) -> std::result::Result<ReplicationTask, sqlx::Error> {
    let task_type: i32 = row.try_get("task_type")?;
    Ok(ReplicationTask {
        task_id: row.try_get("task_id")?,
        task_type: ReplicationTaskType::from_code(task_type),
        namespace_id: row.try_get("namespace_id")?,
        workflow_id: row.try_get("workflow_id")?,
        run_id: row.try_get("run_id")?,
        scheduled_event_id: row.try_get("scheduled_event_id")?,
        first_event_id: row.try_get("first_event_id")?,
        next_event_id: row.try_get("next_event_id")?,
        version: row.try_get("version")?,
        branch_token: row.try_get("branch_token")?,
        new_run_branch_token: row.try_get("new_run_branch_token")?,
    })
}

/// Replication queue backed by SQLite.
pub struct SqliteTaskStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteTaskStore {
    /// Open (creating if needed) a queue database at `path` in WAL mode.
    pub async fn new(path: &str) -> Result<Self> {
        Self::with_config(&TaskStoreConfig {
            sqlite_path: path.to_string(),
            wal_mode: true,
        })
        .await
    }

    /// Open a queue database from config. `":memory:"` gives a private
    /// in-memory database.
    pub async fn with_config(config: &TaskStoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Initializing replication task store");

        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };

        let journal_mode = if config.wal_mode && !in_memory {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal_mode)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        // A single connection keeps one shared database for ":memory:".
        let max_connections = if in_memory { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_tasks (
                task_id INTEGER PRIMARY KEY,
                task_type INTEGER NOT NULL,
                namespace_id TEXT NOT NULL,
                workflow_id TEXT NOT NULL,
                run_id TEXT NOT NULL,
                scheduled_event_id INTEGER NOT NULL DEFAULT 0,
                first_event_id INTEGER NOT NULL DEFAULT 0,
                next_event_id INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 0,
                branch_token BLOB NOT NULL,
                new_run_branch_token BLOB,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let pending: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM replication_tasks")
            .fetch_one(&pool)
            .await?;
        if pending > 0 {
            info!(pending, "Replication tasks pending from previous run");
        }

        Ok(Self { pool, path })
    }

    /// Enqueue a task. Re-appending an existing id replaces the row.
    pub async fn append(&self, task: &ReplicationTask) -> Result<()> {
        let pool = &self.pool;
        let now = chrono::Utc::now().timestamp_millis();

        execute_with_retry("append", || async {
            sqlx::query(
                r#"
                INSERT INTO replication_tasks (
                    task_id, task_type, namespace_id, workflow_id, run_id,
                    scheduled_event_id, first_event_id, next_event_id, version,
                    branch_token, new_run_branch_token, created_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(task_id) DO UPDATE SET
                    task_type = excluded.task_type,
                    namespace_id = excluded.namespace_id,
                    workflow_id = excluded.workflow_id,
                    run_id = excluded.run_id,
                    scheduled_event_id = excluded.scheduled_event_id,
                    first_event_id = excluded.first_event_id,
                    next_event_id = excluded.next_event_id,
                    version = excluded.version,
                    branch_token = excluded.branch_token,
                    new_run_branch_token = excluded.new_run_branch_token
                "#,
            )
            .bind(task.task_id)
            .bind(task.task_type.code())
            .bind(&task.namespace_id)
            .bind(&task.workflow_id)
            .bind(&task.run_id)
            .bind(task.scheduled_event_id)
            .bind(task.first_event_id)
            .bind(task.next_event_id)
            .bind(task.version)
            .bind(&task.branch_token)
            .bind(task.new_run_branch_token.as_deref())
            .bind(now)
            .execute(pool)
            .await
        })
        .await?;

        debug!(task_id = task.task_id, task_type = %task.task_type, "Appended replication task");
        Ok(())
    }

    /// Number of tasks not yet completed.
    pub async fn pending_count(&self) -> Result<i64> {
        let pool = &self.pool;
        let count = execute_with_retry("pending_count", || async {
            sqlx::query_scalar("SELECT COUNT(*) FROM replication_tasks")
                .fetch_one(pool)
                .await
        })
        .await?;
        Ok(count)
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;

        execute_with_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Replication task store closed");
    }
}

impl TaskStore for SqliteTaskStore {
    fn get_tasks(&self, after_task_id: i64, batch_size: usize) -> TaskFuture<'_, Vec<ReplicationTask>> {
        Box::pin(async move {
            let pool = &self.pool;
            let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
            let rows = execute_with_retry("get_tasks", || async {
                sqlx::query(
                    r#"
                    SELECT task_id, task_type, namespace_id, workflow_id, run_id,
                           scheduled_event_id, first_event_id, next_event_id, version,
                           branch_token, new_run_branch_token
                    FROM replication_tasks
                    WHERE task_id > ?
                    ORDER BY task_id
                    LIMIT ?
                    "#,
                )
                .bind(after_task_id)
                .bind(limit)
                .fetch_all(pool)
                .await
            })
            .await?;

            let tasks = rows
                .iter()
                .map(task_from_row)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tasks)
        })
    }

    fn complete_task(&self, task_id: i64) -> TaskFuture<'_, ()> {
        Box::pin(async move {
            let pool = &self.pool;
            let result = execute_with_retry("complete_task", || async {
                sqlx::query("DELETE FROM replication_tasks WHERE task_id = ?")
                    .bind(task_id)
                    .execute(pool)
                    .await
            })
            .await?;

            if result.rows_affected() == 0 {
                debug!(task_id, "Task already completed");
            }
            Ok(())
        })
    }
}
