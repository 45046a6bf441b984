//! Persistent job queue
//!
//! A single SQLite file with one `jobs` table. Every read-modify-write
//! runs under a queue-wide mutex and a short transaction; the unique
//! index on `filepath` is the duplicate-suppression point for the
//! watcher and scanner. Jobs are never deleted — history is retained.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::{FromRow, Row};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;

/// Lifecycle states of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting to be picked up
    Pending,
    /// Claimed by a worker; transient, cleared on startup
    Processing,
    /// Repaired successfully
    Completed,
    /// Repair failed; `retry_count` tracks how often
    Failed,
    /// Source file moved to the broken folder after exhausting retries
    Moved,
}

impl JobStatus {
    /// Stable TEXT representation stored in the table
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Moved => "moved",
        }
    }
}

/// One row of the jobs table
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique row id
    pub id: i64,
    /// Absolute path of the NZB file (unique)
    pub filepath: String,
    /// Path relative to the watch root
    pub relative_path: String,
    /// Current status as stored text
    pub status: String,
    /// Error message of the last failure
    pub error_msg: Option<String>,
    /// Number of failures so far
    pub retry_count: i64,
    /// Unix timestamp of row creation
    pub created_at: i64,
    /// Unix timestamp of the last mutation
    pub updated_at: i64,
}

impl Job {
    /// Whether the stored status equals the given state
    pub fn has_status(&self, status: JobStatus) -> bool {
        self.status == status.as_str()
    }
}

/// Durable job queue backed by a single SQLite file
pub struct Queue {
    pool: SqlitePool,
    // Serializes read-modify-write sequences that SQLite alone cannot
    // make atomic across the unique-path key
    write_lock: Mutex<()>,
}

impl Queue {
    /// Open (or create) the queue store and run forward migrations
    pub async fn open(path: &Path) -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| QueueError::OpenFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(|e| QueueError::OpenFailed(e.to_string()))?;

        let queue = Self {
            pool,
            write_lock: Mutex::new(()),
        };
        queue.migrate().await?;
        Ok(queue)
    }

    async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filepath TEXT NOT NULL UNIQUE,
                relative_path TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending',
                error_msg TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Upgrade older stores that predate these columns; "duplicate
        // column" means the column is already there.
        for alter in [
            "ALTER TABLE jobs ADD COLUMN retry_count INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE jobs ADD COLUMN relative_path TEXT NOT NULL DEFAULT ''",
        ] {
            if let Err(e) = sqlx::query(alter).execute(&self.pool).await {
                if !e.to_string().contains("duplicate column") {
                    warn!(query = alter, error = %e, "schema upgrade statement failed");
                }
            }
        }

        if let Err(e) = sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_status_created_at ON jobs (status, created_at)",
        )
        .execute(&self.pool)
        .await
        {
            warn!(error = %e, "failed to create status index");
        }

        Ok(())
    }

    /// Register an NZB path. New paths insert as `pending`; a
    /// `failed`/`completed` row is reset to `pending` with its
    /// `retry_count` preserved; `pending`/`processing`/`moved` rows are
    /// left untouched.
    pub async fn add_job(&self, filepath: &str, relative_path: &str) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;
        let now = unix_now();

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT id, status FROM jobs WHERE filepath = ?")
            .bind(filepath)
            .fetch_optional(&mut *tx)
            .await?;

        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO jobs (filepath, relative_path, status, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(filepath)
                .bind(relative_path)
                .bind(JobStatus::Pending.as_str())
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            Some(row) => {
                let status: String = row.get("status");
                if status == JobStatus::Failed.as_str() || status == JobStatus::Completed.as_str() {
                    sqlx::query(
                        "UPDATE jobs SET status = ?, error_msg = NULL, relative_path = ?,
                         updated_at = ? WHERE filepath = ?",
                    )
                    .bind(JobStatus::Pending.as_str())
                    .bind(relative_path)
                    .bind(now)
                    .bind(filepath)
                    .execute(&mut *tx)
                    .await?;
                    debug!(filepath, relative_path, "reset existing job to pending");
                } else {
                    debug!(filepath, status, "ignoring add for active job");
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Claim the oldest pending job, marking it `processing`.
    ///
    /// `None` means the queue is idle — try again later.
    pub async fn get_next_job(&self) -> Result<Option<Job>, QueueError> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;

        let job: Option<Job> = sqlx::query_as(
            "SELECT id, filepath, relative_path, status, error_msg, retry_count,
                    created_at, updated_at
             FROM jobs WHERE status = ? ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(JobStatus::Pending.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(mut job) = job else {
            return Ok(None);
        };

        sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(JobStatus::Processing.as_str())
            .bind(unix_now())
            .bind(job.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        job.status = JobStatus::Processing.as_str().to_string();
        Ok(Some(job))
    }

    /// Update a job's status. Transitioning to `failed` increments
    /// `retry_count` in the same statement.
    pub async fn update_job_status(
        &self,
        id: i64,
        status: JobStatus,
        error_msg: Option<&str>,
    ) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;
        let now = unix_now();

        let query = if status == JobStatus::Failed {
            "UPDATE jobs SET status = ?, error_msg = ?, updated_at = ?,
             retry_count = retry_count + 1 WHERE id = ?"
        } else {
            "UPDATE jobs SET status = ?, error_msg = ?, updated_at = ? WHERE id = ?"
        };

        sqlx::query(query)
            .bind(status.as_str())
            .bind(error_msg)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reset every `processing` row to `pending`. Called on startup to
    /// recover jobs interrupted by a crash; returns the affected count.
    pub async fn cleanup_processing_jobs(&self) -> Result<u64, QueueError> {
        let _guard = self.write_lock.lock().await;

        let result = sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE status = ?")
            .bind(JobStatus::Pending.as_str())
            .bind(unix_now())
            .bind(JobStatus::Processing.as_str())
            .execute(&self.pool)
            .await?;

        let affected = result.rows_affected();
        if affected > 0 {
            info!(count = affected, "reset interrupted jobs to pending");
        }
        Ok(affected)
    }

    /// Move every `failed` file that exhausted its retries into the
    /// broken folder and mark the row `moved`. Individual file errors
    /// are logged and do not abort the sweep; returns the moved count.
    pub async fn move_failed_files(
        &self,
        max_retries: i64,
        broken_dir: &Path,
    ) -> Result<u64, QueueError> {
        let _guard = self.write_lock.lock().await;

        tokio::fs::create_dir_all(broken_dir)
            .await
            .map_err(|e| QueueError::OpenFailed(format!("failed to create broken folder: {e}")))?;

        let rows: Vec<Job> = sqlx::query_as(
            "SELECT id, filepath, relative_path, status, error_msg, retry_count,
                    created_at, updated_at
             FROM jobs WHERE status = ? AND retry_count >= ?",
        )
        .bind(JobStatus::Failed.as_str())
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?;

        let mut moved = 0u64;
        for job in rows {
            let Some(filename) = Path::new(&job.filepath).file_name() else {
                warn!(filepath = %job.filepath, "skipping job with no filename");
                continue;
            };
            let dest = broken_dir.join(filename);

            if let Err(e) = tokio::fs::rename(&job.filepath, &dest).await {
                error!(
                    filepath = %job.filepath,
                    dest = %dest.display(),
                    error = %e,
                    "failed to move file to broken folder"
                );
                continue;
            }

            if let Err(e) = sqlx::query("UPDATE jobs SET status = ?, updated_at = ? WHERE id = ?")
                .bind(JobStatus::Moved.as_str())
                .bind(unix_now())
                .bind(job.id)
                .execute(&self.pool)
                .await
            {
                error!(job_id = job.id, error = %e, "failed to update job status after move");
                continue;
            }

            moved += 1;
            info!(
                filepath = %job.filepath,
                dest = %dest.display(),
                retry_count = job.retry_count,
                "moved failed file to broken folder"
            );
        }

        Ok(moved)
    }

    /// Fetch a job by path (tests and diagnostics)
    pub async fn get_job_by_path(&self, filepath: &str) -> Result<Option<Job>, QueueError> {
        let job = sqlx::query_as(
            "SELECT id, filepath, relative_path, status, error_msg, retry_count,
                    created_at, updated_at
             FROM jobs WHERE filepath = ?",
        )
        .bind(filepath)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// All rows in insertion order (tests and diagnostics)
    pub async fn list_jobs(&self) -> Result<Vec<Job>, QueueError> {
        let jobs = sqlx::query_as(
            "SELECT id, filepath, relative_path, status, error_msg, retry_count,
                    created_at, updated_at
             FROM jobs ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    /// Close the underlying pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
