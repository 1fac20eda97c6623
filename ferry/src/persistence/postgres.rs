use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, warn};

use crate::config::PersistenceConfig;
use crate::error::{StoreError, StoreResult};
use crate::job::{
    Attempt, AttemptId, AttemptOutcome, AttemptOutput, AttemptStatus, Checkpoint,
    CheckpointRecord, ConnectionId, Job, JobConfig, JobId, JobStatus, JobStatusChange,
    NewJob, OperationKind,
};
use crate::store::JobStore;

const SCHEMA: &str = include_str!("../../migrations/0001_ferry_schema.sql");

const JOB_COLUMNS: &str = "id, connection_id, operation, status, pool, config_snapshot, \
                           failure_reason, created_at, updated_at";

const ATTEMPT_COLUMNS: &str = "id, job_id, attempt_number, status, started_at, ended_at, \
                               unit_id, checkpoint_blob, output_summary";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Corrupt(err.to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().map(|c| c.to_string()).as_deref() == Some("23505")
        }
        _ => false,
    }
}

fn corrupt(what: &str, value: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("invalid {what}: {value}"))
}

fn job_from_row(row: &PgRow) -> StoreResult<Job> {
    let operation: String = row.try_get("operation")?;
    let status: String = row.try_get("status")?;
    let config: serde_json::Value = row.try_get("config_snapshot")?;

    Ok(Job {
        id: JobId(row.try_get("id")?),
        connection_id: ConnectionId(row.try_get("connection_id")?),
        operation: OperationKind::parse(&operation)
            .ok_or_else(|| corrupt("operation", &operation))?,
        status: JobStatus::parse(&status).ok_or_else(|| corrupt("job status", &status))?,
        pool: row.try_get("pool")?,
        config: serde_json::from_value::<JobConfig>(config)
            .map_err(|e| corrupt("config snapshot", e))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        failure_reason: row.try_get("failure_reason")?,
    })
}

fn attempt_from_row(row: &PgRow) -> StoreResult<Attempt> {
    let status: String = row.try_get("status")?;
    let number: i32 = row.try_get("attempt_number")?;
    let checkpoint: Option<serde_json::Value> = row.try_get("checkpoint_blob")?;
    let output: serde_json::Value = row.try_get("output_summary")?;

    Ok(Attempt {
        id: AttemptId(row.try_get("id")?),
        job_id: JobId(row.try_get("job_id")?),
        number: u32::try_from(number).map_err(|_| corrupt("attempt number", number))?,
        status: AttemptStatus::parse(&status)
            .ok_or_else(|| corrupt("attempt status", &status))?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        unit_id: row.try_get("unit_id")?,
        checkpoint: checkpoint.map(Checkpoint::new),
        output: serde_json::from_value::<AttemptOutput>(output)
            .map_err(|e| corrupt("output summary", e))?,
    })
}

fn checkpoint_from_row(row: &PgRow) -> StoreResult<CheckpointRecord> {
    let sequence: i64 = row.try_get("sequence")?;
    Ok(CheckpointRecord {
        job_id: JobId(row.try_get("job_id")?),
        attempt_id: AttemptId(row.try_get("attempt_id")?),
        sequence: u64::try_from(sequence).map_err(|_| corrupt("checkpoint sequence", sequence))?,
        checkpoint: Checkpoint::new(row.try_get("checkpoint_blob")?),
        created_at: row.try_get("created_at")?,
    })
}

/// PostgreSQL-backed [`JobStore`].
///
/// Each operation runs in its own transaction. Row locks on `ferry_jobs`
/// serialize writers of the same job; partial unique indexes back the
/// one-active-job-per-connection and one-running-attempt-per-job rules.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool using the persistence settings.
    pub async fn connect(config: &PersistenceConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
            .connect(&config.connection_string)
            .await?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_job(
        tx: &mut Transaction<'_, Postgres>,
        job_id: JobId,
    ) -> StoreResult<JobStatus> {
        let row = sqlx::query("SELECT status FROM ferry_jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id.0)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        let status: String = row.try_get("status")?;
        JobStatus::parse(&status).ok_or_else(|| corrupt("job status", &status))
    }

    async fn ensure_job(&self, job_id: JobId) -> StoreResult<()> {
        sqlx::query("SELECT 1 FROM ferry_jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    async fn active_job_for(&self, connection_id: ConnectionId) -> StoreResult<Option<JobId>> {
        let row = sqlx::query(
            r#"
            SELECT id FROM ferry_jobs
            WHERE connection_id = $1
              AND status IN ('PENDING', 'RUNNING')
            LIMIT 1
            "#,
        )
        .bind(connection_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get::<i64, _>("id").map(JobId))
            .transpose()
            .map_err(Into::into)
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(&self, job: NewJob) -> StoreResult<Job> {
        let config = serde_json::to_value(&job.config)
            .map_err(|e| StoreError::Backend(format!("config snapshot: {e}")))?;
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO ferry_jobs (connection_id, operation, status, pool, config_snapshot)
            VALUES ($1, $2, 'PENDING', $3, $4)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.connection_id.0)
        .bind(job.operation.as_str())
        .bind(&job.pool)
        .bind(&config)
        .fetch_one(&mut *tx)
        .await;

        let row = match inserted {
            Ok(row) => row,
            Err(err) if is_unique_violation(&err) => {
                drop(tx.rollback().await);
                let existing = self.active_job_for(job.connection_id).await?;
                debug!(
                    connection_id = %job.connection_id,
                    "rejected job for connection with an active job"
                );
                return Err(match existing {
                    Some(job_id) => StoreError::AlreadyRunning {
                        connection_id: job.connection_id,
                        job_id,
                    },
                    None => StoreError::Unavailable(
                        "conflicting job finished concurrently, retry".into(),
                    ),
                });
            }
            Err(err) => {
                drop(tx.rollback().await);
                return Err(err.into());
            }
        };
        let created = job_from_row(&row)?;

        sqlx::query("INSERT INTO ferry_job_status_history (job_id, status) VALUES ($1, 'PENDING')")
            .bind(created.id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(created)
    }

    async fn create_attempt(&self, job_id: JobId) -> StoreResult<Attempt> {
        let mut tx = self.pool.begin().await?;

        let status = Self::lock_job(&mut tx, job_id).await?;
        if status.is_terminal() {
            drop(tx.rollback().await);
            return Err(StoreError::InvalidState(format!(
                "job {job_id} is {status}, cannot start an attempt"
            )));
        }

        let previous = sqlx::query(
            r#"
            SELECT attempt_number, status FROM ferry_attempts
            WHERE job_id = $1
            ORDER BY attempt_number DESC
            LIMIT 1
            "#,
        )
        .bind(job_id.0)
        .fetch_optional(&mut *tx)
        .await?;

        let number = match previous {
            Some(row) => {
                let number: i32 = row.try_get("attempt_number")?;
                let status: String = row.try_get("status")?;
                if status == AttemptStatus::Running.as_str() {
                    drop(tx.rollback().await);
                    return Err(StoreError::InvalidState(format!(
                        "attempt {number} of job {job_id} is still RUNNING"
                    )));
                }
                number + 1
            }
            None => 0,
        };

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO ferry_attempts (job_id, attempt_number, status)
            VALUES ($1, $2, 'RUNNING')
            RETURNING {ATTEMPT_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(number)
        .fetch_one(&mut *tx)
        .await?;
        let attempt = attempt_from_row(&row)?;

        tx.commit().await?;
        Ok(attempt)
    }

    async fn set_attempt_unit(&self, attempt_id: AttemptId, unit_id: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE ferry_attempts SET unit_id = $2 WHERE id = $1")
            .bind(attempt_id.0)
            .bind(unit_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("attempt {attempt_id}")));
        }
        Ok(())
    }

    async fn record_attempt_outcome(
        &self,
        attempt_id: AttemptId,
        outcome: &AttemptOutcome,
    ) -> StoreResult<Attempt> {
        if !outcome.status.is_terminal() {
            return Err(StoreError::InvalidState(format!(
                "outcome for attempt {attempt_id} is not terminal"
            )));
        }
        let output = serde_json::to_value(&outcome.output)
            .map_err(|e| StoreError::Backend(format!("output summary: {e}")))?;

        let mut tx = self.pool.begin().await?;
        let current = sqlx::query("SELECT status FROM ferry_attempts WHERE id = $1 FOR UPDATE")
            .bind(attempt_id.0)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("attempt {attempt_id}")))?;
        let status: String = current.try_get("status")?;
        if status != AttemptStatus::Running.as_str() {
            drop(tx.rollback().await);
            return Err(StoreError::InvalidState(format!(
                "attempt {attempt_id} already finished as {status}"
            )));
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE ferry_attempts
            SET status = $2,
                output_summary = $3,
                ended_at = NOW()
            WHERE id = $1
            RETURNING {ATTEMPT_COLUMNS}
            "#
        ))
        .bind(attempt_id.0)
        .bind(outcome.status.as_str())
        .bind(&output)
        .fetch_one(&mut *tx)
        .await?;
        let attempt = attempt_from_row(&row)?;

        tx.commit().await?;
        Ok(attempt)
    }

    async fn record_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: Checkpoint,
    ) -> StoreResult<CheckpointRecord> {
        let mut tx = self.pool.begin().await?;
        Self::lock_job(&mut tx, job_id).await?;

        let attempt = sqlx::query(
            r#"
            UPDATE ferry_attempts
            SET checkpoint_blob = $2
            WHERE job_id = $1 AND status = 'RUNNING'
            RETURNING id
            "#,
        )
        .bind(job_id.0)
        .bind(checkpoint.as_value())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(attempt) = attempt else {
            drop(tx.rollback().await);
            return Err(StoreError::InvalidState(format!(
                "job {job_id} has no running attempt to checkpoint"
            )));
        };
        let attempt_id: i64 = attempt.try_get("id")?;

        let row = sqlx::query(
            r#"
            INSERT INTO ferry_checkpoints (job_id, sequence, attempt_id, checkpoint_blob)
            SELECT $1, COALESCE(MAX(sequence), 0) + 1, $2, $3
            FROM ferry_checkpoints
            WHERE job_id = $1
            RETURNING job_id, sequence, attempt_id, checkpoint_blob, created_at
            "#,
        )
        .bind(job_id.0)
        .bind(attempt_id)
        .bind(checkpoint.as_value())
        .fetch_one(&mut *tx)
        .await?;
        let record = checkpoint_from_row(&row)?;

        tx.commit().await?;
        Ok(record)
    }

    async fn transition_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        reason: Option<String>,
    ) -> StoreResult<Job> {
        let mut tx = self.pool.begin().await?;

        let current = Self::lock_job(&mut tx, job_id).await?;
        if !current.can_transition_to(status) {
            drop(tx.rollback().await);
            warn!(
                job_id = %job_id,
                from = %current,
                to = %status,
                "rejected invalid job transition"
            );
            return Err(StoreError::InvalidState(format!(
                "job {job_id} cannot move from {current} to {status}"
            )));
        }

        let row = sqlx::query(&format!(
            r#"
            UPDATE ferry_jobs
            SET status = $2,
                failure_reason = CASE WHEN $3 THEN $4 ELSE failure_reason END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.0)
        .bind(status.as_str())
        .bind(status.is_terminal())
        .bind(&reason)
        .fetch_one(&mut *tx)
        .await?;
        let job = job_from_row(&row)?;

        sqlx::query(
            "INSERT INTO ferry_job_status_history (job_id, status, reason) VALUES ($1, $2, $3)",
        )
        .bind(job_id.0)
        .bind(status.as_str())
        .bind(&reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Job> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM ferry_jobs WHERE id = $1"))
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))?;
        job_from_row(&row)
    }

    async fn list_attempts(&self, job_id: JobId) -> StoreResult<Vec<Attempt>> {
        self.ensure_job(job_id).await?;
        let rows = sqlx::query(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM ferry_attempts WHERE job_id = $1 ORDER BY attempt_number"
        ))
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn latest_checkpoint(&self, job_id: JobId) -> StoreResult<Option<Checkpoint>> {
        self.ensure_job(job_id).await?;
        let row = sqlx::query(
            r#"
            SELECT checkpoint_blob FROM ferry_checkpoints
            WHERE job_id = $1
            ORDER BY sequence DESC
            LIMIT 1
            "#,
        )
        .bind(job_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.try_get::<serde_json::Value, _>("checkpoint_blob").map(Checkpoint::new))
            .transpose()
            .map_err(Into::into)
    }

    async fn checkpoint_history(&self, job_id: JobId) -> StoreResult<Vec<CheckpointRecord>> {
        self.ensure_job(job_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT job_id, sequence, attempt_id, checkpoint_blob, created_at
            FROM ferry_checkpoints
            WHERE job_id = $1
            ORDER BY sequence
            "#,
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn job_status_history(&self, job_id: JobId) -> StoreResult<Vec<JobStatusChange>> {
        self.ensure_job(job_id).await?;
        let rows = sqlx::query(
            r#"
            SELECT status, reason, changed_at
            FROM ferry_job_status_history
            WHERE job_id = $1
            ORDER BY id
            "#,
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> StoreResult<JobStatusChange> {
                let status: String = row.try_get("status")?;
                let at: DateTime<Utc> = row.try_get("changed_at")?;
                Ok(JobStatusChange {
                    job_id,
                    status: JobStatus::parse(&status)
                        .ok_or_else(|| corrupt("job status", &status))?,
                    reason: row.try_get("reason")?,
                    at,
                })
            })
            .collect()
    }

    async fn list_active_jobs(&self) -> StoreResult<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM ferry_jobs
            WHERE status IN ('PENDING', 'RUNNING')
            ORDER BY id
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }
}
