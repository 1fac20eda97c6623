use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ferry::error::{StoreError, StoreResult};
use ferry::job::{
    Attempt, AttemptId, AttemptOutcome, Checkpoint, CheckpointRecord, Job, JobId, JobStatus,
    JobStatusChange, NewJob,
};
use ferry::store::JobStore;
use parking_lot::Mutex;

#[derive(Default)]
struct Faults {
    /// Fail this many upcoming calls, whatever the operation.
    next_calls: u32,
    /// Fail this many upcoming calls of a named operation.
    by_operation: HashMap<&'static str, u32>,
    /// Apply this many upcoming calls of an operation, then report an outage.
    lost_replies: HashMap<&'static str, u32>,
    latency: HashMap<&'static str, Duration>,
    down: bool,
    injected: u32,
    calls: HashMap<&'static str, u32>,
}

/// Store wrapper that injects `StoreError::Unavailable` on demand.
///
/// Plain failures are injected before the inner store is touched, so such
/// a call never has side effects. [`lose_replies`](Self::lose_replies)
/// instead applies the call and then reports the outage, like a connection
/// dropping after a commit.
#[derive(Clone)]
pub struct FlakyStore {
    inner: Arc<dyn JobStore>,
    faults: Arc<Mutex<Faults>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn JobStore>) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    pub fn inner(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.inner)
    }

    /// Fail the next `calls` calls.
    pub fn fail_next(&self, calls: u32) {
        self.faults.lock().next_calls = calls;
    }

    /// Fail the next `calls` calls of `operation`, e.g. `"record_checkpoint"`.
    pub fn fail_operation(&self, operation: &'static str, calls: u32) {
        self.faults.lock().by_operation.insert(operation, calls);
    }

    /// Apply the next `calls` calls of `operation`, then fail them anyway.
    pub fn lose_replies(&self, operation: &'static str, calls: u32) {
        self.faults.lock().lost_replies.insert(operation, calls);
    }

    /// Delay every call of `operation` by `latency`.
    pub fn slow_operation(&self, operation: &'static str, latency: Duration) {
        self.faults.lock().latency.insert(operation, latency);
    }

    /// Fail every call until set back to `false`.
    pub fn set_down(&self, down: bool) {
        self.faults.lock().down = down;
    }

    /// Number of failures injected so far.
    pub fn injected_failures(&self) -> u32 {
        self.faults.lock().injected
    }

    /// Calls made to `operation`, failed ones included.
    pub fn calls(&self, operation: &str) -> u32 {
        self.faults.lock().calls.get(operation).copied().unwrap_or(0)
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        if let Some(latency) = self.before(operation)? {
            tokio::time::sleep(latency).await;
        }
        let value = call.await?;
        self.after(operation)?;
        Ok(value)
    }

    fn before(&self, operation: &'static str) -> StoreResult<Option<Duration>> {
        let mut faults = self.faults.lock();
        *faults.calls.entry(operation).or_default() += 1;

        let fail = if faults.down {
            true
        } else if faults.next_calls > 0 {
            faults.next_calls -= 1;
            true
        } else {
            take_one(&mut faults.by_operation, operation)
        };

        if fail {
            return Err(outage(&mut faults, operation));
        }
        Ok(faults.latency.get(operation).copied())
    }

    fn after(&self, operation: &'static str) -> StoreResult<()> {
        let mut faults = self.faults.lock();
        if take_one(&mut faults.lost_replies, operation) {
            return Err(outage(&mut faults, operation));
        }
        Ok(())
    }
}

fn take_one(budget: &mut HashMap<&'static str, u32>, operation: &'static str) -> bool {
    match budget.get_mut(operation) {
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

fn outage(faults: &mut Faults, operation: &'static str) -> StoreError {
    faults.injected += 1;
    tracing::debug!(operation, "injecting store outage");
    StoreError::Unavailable(format!("injected outage during {operation}"))
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn create_job(&self, job: NewJob) -> StoreResult<Job> {
        self.call("create_job", self.inner.create_job(job)).await
    }

    async fn create_attempt(&self, job_id: JobId) -> StoreResult<Attempt> {
        self.call("create_attempt", self.inner.create_attempt(job_id))
            .await
    }

    async fn set_attempt_unit(&self, attempt_id: AttemptId, unit_id: &str) -> StoreResult<()> {
        self.call(
            "set_attempt_unit",
            self.inner.set_attempt_unit(attempt_id, unit_id),
        )
        .await
    }

    async fn record_attempt_outcome(
        &self,
        attempt_id: AttemptId,
        outcome: &AttemptOutcome,
    ) -> StoreResult<Attempt> {
        self.call(
            "record_attempt_outcome",
            self.inner.record_attempt_outcome(attempt_id, outcome),
        )
        .await
    }

    async fn record_checkpoint(
        &self,
        job_id: JobId,
        checkpoint: Checkpoint,
    ) -> StoreResult<CheckpointRecord> {
        self.call(
            "record_checkpoint",
            self.inner.record_checkpoint(job_id, checkpoint),
        )
        .await
    }

    async fn transition_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        reason: Option<String>,
    ) -> StoreResult<Job> {
        self.call(
            "transition_job",
            self.inner.transition_job(job_id, status, reason),
        )
        .await
    }

    async fn get_job(&self, job_id: JobId) -> StoreResult<Job> {
        self.call("get_job", self.inner.get_job(job_id)).await
    }

    async fn list_attempts(&self, job_id: JobId) -> StoreResult<Vec<Attempt>> {
        self.call("list_attempts", self.inner.list_attempts(job_id))
            .await
    }

    async fn latest_checkpoint(&self, job_id: JobId) -> StoreResult<Option<Checkpoint>> {
        self.call("latest_checkpoint", self.inner.latest_checkpoint(job_id))
            .await
    }

    async fn checkpoint_history(&self, job_id: JobId) -> StoreResult<Vec<CheckpointRecord>> {
        self.call("checkpoint_history", self.inner.checkpoint_history(job_id))
            .await
    }

    async fn job_status_history(&self, job_id: JobId) -> StoreResult<Vec<JobStatusChange>> {
        self.call("job_status_history", self.inner.job_status_history(job_id))
            .await
    }

    async fn list_active_jobs(&self) -> StoreResult<Vec<Job>> {
        self.call("list_active_jobs", self.inner.list_active_jobs())
            .await
    }
}
