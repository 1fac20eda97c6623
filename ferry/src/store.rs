use async_trait::async_trait;

use crate::error::StoreResult;
use crate::job::{
    Attempt, AttemptId, AttemptOutcome, Checkpoint, CheckpointRecord, Job, JobId,
    JobStatus, JobStatusChange, NewJob,
};

/// Durable record of jobs, attempts, checkpoints and status history.
///
/// Every method is a single atomic transaction: a reader that comes up after
/// a crash observes every write that returned `Ok` before it. Storage outages
/// surface as [`StoreError::Unavailable`](crate::error::StoreError::Unavailable);
/// implementations never retry on their own.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a `PENDING` job.
    ///
    /// Fails with `AlreadyRunning` when the connection already has a
    /// non-terminal job. The check and the insert are one transaction.
    async fn create_job(&self, job: NewJob) -> StoreResult<Job>;

    /// Create the next attempt of a job in `RUNNING` state.
    ///
    /// Fails with `InvalidState` if the job is terminal or its previous
    /// attempt has no terminal outcome yet.
    async fn create_attempt(&self, job_id: JobId) -> StoreResult<Attempt>;

    /// Remember which execution unit backs an attempt.
    async fn set_attempt_unit(&self, attempt_id: AttemptId, unit_id: &str) -> StoreResult<()>;

    /// Record the terminal outcome of a running attempt.
    async fn record_attempt_outcome(
        &self,
        attempt_id: AttemptId,
        outcome: &AttemptOutcome,
    ) -> StoreResult<Attempt>;

    /// Persist a checkpoint emitted by the job's running attempt.
    async fn record_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: Checkpoint,
    ) -> StoreResult<CheckpointRecord>;

    /// Move a job to `status`, appending to its status history.
    ///
    /// `reason` is stored as the failure reason for terminal statuses.
    async fn transition_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        reason: Option<String>,
    ) -> StoreResult<Job>;

    async fn get_job(&self, job_id: JobId) -> StoreResult<Job>;

    /// Attempts of a job ordered by attempt number.
    async fn list_attempts(&self, job_id: JobId) -> StoreResult<Vec<Attempt>>;

    /// The most recently persisted checkpoint of a job, across all attempts.
    async fn latest_checkpoint(&self, job_id: JobId) -> StoreResult<Option<Checkpoint>>;

    async fn checkpoint_history(&self, job_id: JobId) -> StoreResult<Vec<CheckpointRecord>>;

    async fn job_status_history(&self, job_id: JobId) -> StoreResult<Vec<JobStatusChange>>;

    /// Every `PENDING` or `RUNNING` job, ordered by id.
    async fn list_active_jobs(&self) -> StoreResult<Vec<Job>>;
}
