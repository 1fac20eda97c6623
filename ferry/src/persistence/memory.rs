use std::collections::{BTreeMap, HashMap};
use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{StoreError, StoreResult};
use crate::job::{
    Attempt, AttemptId, AttemptOutcome, AttemptOutput, AttemptStatus, Checkpoint,
    CheckpointRecord, ConnectionId, Job, JobId, JobStatus, JobStatusChange, NewJob,
};
use crate::store::JobStore;

/// In-memory [`JobStore`].
///
/// All state sits behind one mutex, so every operation is trivially a single
/// transaction. Nothing survives the process; "restart" in tests means
/// building a new dispatcher over the same store instance.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    next_job_id: i64,
    next_attempt_id: i64,
    jobs: BTreeMap<JobId, Job>,
    attempts: HashMap<JobId, Vec<Attempt>>,
    checkpoints: HashMap<JobId, Vec<CheckpointRecord>>,
    history: HashMap<JobId, Vec<JobStatusChange>>,
    active_by_connection: HashMap<ConnectionId, JobId>,
}

impl fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryJobStore");
        match self.state.try_lock() {
            Some(state) => {
                debug.field("jobs", &state.jobs.len());
                debug.field("active", &state.active_by_connection.len());
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish_non_exhaustive()
    }
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreState {
    fn job_mut(&mut self, job_id: JobId) -> StoreResult<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    fn job(&self, job_id: JobId) -> StoreResult<&Job> {
        self.jobs
            .get(&job_id)
            .ok_or_else(|| StoreError::NotFound(format!("job {job_id}")))
    }

    fn find_attempt_mut(&mut self, attempt_id: AttemptId) -> StoreResult<&mut Attempt> {
        self.attempts
            .values_mut()
            .flat_map(|attempts| attempts.iter_mut())
            .find(|attempt| attempt.id == attempt_id)
            .ok_or_else(|| StoreError::NotFound(format!("attempt {attempt_id}")))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, new_job: NewJob) -> StoreResult<Job> {
        let mut state = self.state.lock();

        if let Some(existing) = state.active_by_connection.get(&new_job.connection_id) {
            return Err(StoreError::AlreadyRunning {
                connection_id: new_job.connection_id,
                job_id: *existing,
            });
        }

        state.next_job_id += 1;
        let now = Utc::now();
        let job = Job {
            id: JobId(state.next_job_id),
            connection_id: new_job.connection_id,
            operation: new_job.operation,
            status: JobStatus::Pending,
            pool: new_job.pool,
            config: new_job.config,
            created_at: now,
            updated_at: now,
            failure_reason: None,
        };

        state.active_by_connection.insert(job.connection_id, job.id);
        state.history.insert(
            job.id,
            vec![JobStatusChange {
                job_id: job.id,
                status: JobStatus::Pending,
                reason: None,
                at: now,
            }],
        );
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn create_attempt(&self, job_id: JobId) -> StoreResult<Attempt> {
        let mut state = self.state.lock();

        let status = state.job(job_id)?.status;
        if status.is_terminal() {
            return Err(StoreError::InvalidState(format!(
                "job {job_id} is {status}, cannot start an attempt"
            )));
        }

        let existing = state.attempts.get(&job_id).map_or(&[][..], Vec::as_slice);
        if let Some(previous) = existing.last() {
            if !previous.status.is_terminal() {
                return Err(StoreError::InvalidState(format!(
                    "attempt {} of job {job_id} is still {}",
                    previous.number, previous.status
                )));
            }
        }
        let number = existing.len() as u32;

        state.next_attempt_id += 1;
        let attempt = Attempt {
            id: AttemptId(state.next_attempt_id),
            job_id,
            number,
            status: AttemptStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            unit_id: None,
            checkpoint: None,
            output: AttemptOutput::default(),
        };
        state.attempts.entry(job_id).or_default().push(attempt.clone());
        Ok(attempt)
    }

    async fn set_attempt_unit(&self, attempt_id: AttemptId, unit_id: &str) -> StoreResult<()> {
        let mut state = self.state.lock();
        let attempt = state.find_attempt_mut(attempt_id)?;
        attempt.unit_id = Some(unit_id.to_string());
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

        let mut state = self.state.lock();
        let attempt = state.find_attempt_mut(attempt_id)?;
        if attempt.status.is_terminal() {
            return Err(StoreError::InvalidState(format!(
                "attempt {attempt_id} already finished as {}",
                attempt.status
            )));
        }

        attempt.status = outcome.status;
        attempt.output = outcome.output.clone();
        attempt.ended_at = Some(Utc::now());
        Ok(attempt.clone())
    }

    async fn record_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: Checkpoint,
    ) -> StoreResult<CheckpointRecord> {
        let mut state = self.state.lock();
        state.job(job_id)?;

        let attempt = state
            .attempts
            .get_mut(&job_id)
            .and_then(|attempts| attempts.last_mut())
            .filter(|attempt| attempt.status == AttemptStatus::Running)
            .ok_or_else(|| {
                StoreError::InvalidState(format!(
                    "job {job_id} has no running attempt to checkpoint"
                ))
            })?;
        attempt.checkpoint = Some(checkpoint.clone());
        let attempt_id = attempt.id;

        let history = state.checkpoints.entry(job_id).or_default();
        let record = CheckpointRecord {
            job_id,
            attempt_id,
            sequence: history.len() as u64 + 1,
            checkpoint,
            created_at: Utc::now(),
        };
        history.push(record.clone());
        Ok(record)
    }

    async fn transition_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        reason: Option<String>,
    ) -> StoreResult<Job> {
        let mut state = self.state.lock();
        let now = Utc::now();

        let job = state.job_mut(job_id)?;
        if !job.status.can_transition_to(status) {
            return Err(StoreError::InvalidState(format!(
                "job {job_id} cannot move from {} to {status}",
                job.status
            )));
        }
        job.status = status;
        job.updated_at = now;
        if status.is_terminal() {
            job.failure_reason = reason.clone();
        }
        let job = job.clone();

        if status.is_terminal() {
            state.active_by_connection.remove(&job.connection_id);
        }
        state.history.entry(job_id).or_default().push(JobStatusChange {
            job_id,
            status,
            reason,
            at: now,
        });
        Ok(job)
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Job> {
        self.state.lock().job(job_id).cloned()
    }

    async fn list_attempts(&self, job_id: JobId) -> StoreResult<Vec<Attempt>> {
        let state = self.state.lock();
        state.job(job_id)?;
        Ok(state.attempts.get(&job_id).cloned().unwrap_or_default())
    }

    async fn latest_checkpoint(&self, job_id: JobId) -> StoreResult<Option<Checkpoint>> {
        let state = self.state.lock();
        state.job(job_id)?;
        Ok(state
            .checkpoints
            .get(&job_id)
            .and_then(|history| history.last())
            .map(|record| record.checkpoint.clone()))
    }

    async fn checkpoint_history(&self, job_id: JobId) -> StoreResult<Vec<CheckpointRecord>> {
        let state = self.state.lock();
        state.job(job_id)?;
        Ok(state.checkpoints.get(&job_id).cloned().unwrap_or_default())
    }

    async fn job_status_history(&self, job_id: JobId) -> StoreResult<Vec<JobStatusChange>> {
        let state = self.state.lock();
        state.job(job_id)?;
        Ok(state.history.get(&job_id).cloned().unwrap_or_default())
    }

    async fn list_active_jobs(&self) -> StoreResult<Vec<Job>> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .values()
            .filter(|job| !job.status.is_terminal())
            .cloned()
            .collect())
    }
}
