//! Durable job records in the `job_records` table.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use contactsync_core::JobId;

use crate::storage::{Database, StorageError, parse_column, u32_column};

use super::types::{JobKind, JobPayload, JobRecord, JobStatus};

const TABLE: &str = "job_records";

/// Job store error.
#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for JobStoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(StorageError::Database(err))
    }
}

impl From<serde_json::Error> for JobStoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(StorageError::Serialization(err))
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
}

/// Persistent store for job records.
///
/// The `*_in` variants run on a caller-owned connection so a record can be
/// written or removed inside the transaction that commits the job's effects.
#[derive(Debug, Clone)]
pub struct JobRecordStore {
    db: Database,
}

impl JobRecordStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn persist(&self, job: &JobRecord) -> Result<(), JobStoreError> {
        let mut conn = self.db.pool().acquire().await?;
        persist_in(&mut conn, job).await
    }

    /// Delete a record. Removing a missing record is not an error.
    pub async fn remove(&self, id: JobId) -> Result<(), JobStoreError> {
        let mut conn = self.db.pool().acquire().await?;
        remove_in(&mut conn, id).await
    }

    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let mut conn = self.db.pool().acquire().await?;
        get_in(&mut conn, id).await
    }

    /// Every unfinished record of `kind`, oldest first.
    ///
    /// `Running` records are included: a record still running at load time
    /// was interrupted by a crash and must run again.
    pub async fn load_all_pending(&self, kind: JobKind) -> Result<Vec<JobRecord>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, payload, status, attempt, created_at, updated_at, next_attempt_at, last_error
            FROM job_records
            WHERE kind = ?1 AND status IN ('pending', 'running')
            ORDER BY created_at, id
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(from_row).collect()
    }

    /// Flag the record as running and charge one attempt.
    pub async fn mark_running(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
        self.modify(id, JobRecord::mark_running).await
    }

    /// Return the record to the queue after a failed run.
    pub async fn record_failure(
        &self,
        id: JobId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<JobRecord, JobStoreError> {
        self.modify(id, |job| job.mark_retrying(error, next_attempt_at))
            .await
    }

    /// Return an interrupted run to the queue without charging the attempt.
    pub async fn mark_pending(&self, id: JobId) -> Result<JobRecord, JobStoreError> {
        self.modify(id, JobRecord::mark_released).await
    }

    pub async fn stats(&self, kind: JobKind) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM job_records WHERE kind = ?1 GROUP BY status",
        )
        .bind(kind.as_str())
        .fetch_all(self.db.pool())
        .await?;

        let mut stats = JobStats::default();
        for row in &rows {
            let status: JobStatus = parse_column(row, "status", TABLE)?;
            let n: i64 = row.try_get("n")?;
            match status {
                JobStatus::Pending => stats.pending = n as usize,
                JobStatus::Running => stats.running = n as usize,
                JobStatus::Succeeded | JobStatus::PermanentlyFailed => {}
            }
        }
        Ok(stats)
    }

    async fn modify(
        &self,
        id: JobId,
        change: impl FnOnce(&mut JobRecord),
    ) -> Result<JobRecord, JobStoreError> {
        let mut tx = self.db.begin().await?;
        let mut job = get_in(&mut tx, id)
            .await?
            .ok_or(JobStoreError::NotFound(id))?;
        change(&mut job);
        update_in(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }
}

pub async fn persist_in(conn: &mut SqliteConnection, job: &JobRecord) -> Result<(), JobStoreError> {
    let payload = serde_json::to_string(&job.payload)?;
    let result = sqlx::query(
        r#"
        INSERT INTO job_records
            (id, kind, payload, status, attempt, created_at, updated_at, next_attempt_at, last_error)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(job.id.to_string())
    .bind(job.kind().as_str())
    .bind(payload)
    .bind(job.status.as_str())
    .bind(i64::from(job.attempt))
    .bind(job.created_at)
    .bind(job.updated_at)
    .bind(job.next_attempt_at)
    .bind(job.last_error.as_deref())
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(JobStoreError::AlreadyExists(job.id))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn remove_in(conn: &mut SqliteConnection, id: JobId) -> Result<(), JobStoreError> {
    sqlx::query("DELETE FROM job_records WHERE id = ?1")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn get_in(
    conn: &mut SqliteConnection,
    id: JobId,
) -> Result<Option<JobRecord>, JobStoreError> {
    let row = sqlx::query(
        r#"
        SELECT id, kind, payload, status, attempt, created_at, updated_at, next_attempt_at, last_error
        FROM job_records
        WHERE id = ?1
        "#,
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(from_row).transpose()
}

pub async fn update_in(conn: &mut SqliteConnection, job: &JobRecord) -> Result<(), JobStoreError> {
    let result = sqlx::query(
        r#"
        UPDATE job_records
        SET status = ?2, attempt = ?3, updated_at = ?4, next_attempt_at = ?5, last_error = ?6
        WHERE id = ?1
        "#,
    )
    .bind(job.id.to_string())
    .bind(job.status.as_str())
    .bind(i64::from(job.attempt))
    .bind(job.updated_at)
    .bind(job.next_attempt_at)
    .bind(job.last_error.as_deref())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(JobStoreError::NotFound(job.id));
    }
    Ok(())
}

fn from_row(row: &SqliteRow) -> Result<JobRecord, JobStoreError> {
    let raw_payload: String = row.try_get("payload")?;
    let payload: JobPayload = serde_json::from_str(&raw_payload)?;
    let kind: JobKind = parse_column(row, "kind", TABLE)?;
    if payload.kind() != kind {
        return Err(StorageError::corrupt(
            TABLE,
            format!("kind column {} does not match payload", kind.as_str()),
        )
        .into());
    }

    Ok(JobRecord {
        id: parse_column(row, "id", TABLE)?,
        payload,
        status: parse_column(row, "status", TABLE)?,
        attempt: u32_column(row, "attempt", TABLE)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("last_error")?,
    })
}
