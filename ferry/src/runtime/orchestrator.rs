use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::cancel::{CancelReason, CancellationToken};
use crate::error::{FerryError, FerryResult, StoreResult};
use crate::events::{EventBus, JobEventPayload};
use crate::job::{Attempt, AttemptOutcome, AttemptStatus, FailureKind, Job, JobId, JobStatus};
use crate::retry::{retry_transient, retry_write, RetryConfig, RetryDecision, StoreRetryConfig};
use crate::store::JobStore;
use crate::substrate::{unit_id_for, ExecutionSubstrate, UnitHandle};
use crate::telemetry;

use super::supervisor::{AttemptSupervisor, SupervisorConfig};

const CANCELLED_REASON: &str = "cancellation requested";

/// Drives one job from its current persisted state to a terminal status.
///
/// The orchestrator keeps no state of its own between steps. Every step
/// re-reads the job and its attempts from the store and decides what to do
/// next, so a job can be picked up by a fresh orchestrator after a crash:
///
/// - last attempt still `RUNNING`: it was abandoned. Destroy its unit and
///   record it as `FAILED`.
/// - last attempt `SUCCEEDED` / `CANCELLED`: the job ends the same way.
/// - last attempt `FAILED`: retry after backoff if the operation's attempt
///   budget allows it, else the job fails.
/// - no attempts: start the first one.
pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    substrate: Arc<dyn ExecutionSubstrate>,
    events: Arc<EventBus>,
    supervisor: AttemptSupervisor,
    retry: RetryConfig,
    store_retry: StoreRetryConfig,
}

impl fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("supervisor", &self.supervisor)
            .field("retry", &self.retry)
            .finish()
    }
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        substrate: Arc<dyn ExecutionSubstrate>,
        events: Arc<EventBus>,
        supervisor: SupervisorConfig,
        retry: RetryConfig,
    ) -> Self {
        let store_retry = supervisor.store_retry;
        let supervisor = AttemptSupervisor::new(
            Arc::clone(&store),
            Arc::clone(&substrate),
            Arc::clone(&events),
            supervisor,
        );
        Self {
            store,
            substrate,
            events,
            supervisor,
            retry,
            store_retry,
        }
    }

    /// Run `job_id` until it is terminal and return the final job.
    ///
    /// Errors leave the job non-terminal and resumable, except for invariant
    /// violations, which mark the job `INCOMPLETE` before being returned.
    pub async fn run(&self, job_id: JobId, cancel: &CancellationToken) -> FerryResult<Job> {
        match self.drive(job_id, cancel).await {
            Err(FerryError::InvariantViolation(reason)) => {
                error!(
                    job_id = %job_id,
                    reason = %reason,
                    "invariant violation, marking job incomplete"
                );
                match self
                    .store
                    .transition_job(job_id, JobStatus::Incomplete, Some(reason.clone()))
                    .await
                {
                    Ok(job) => self.announce_finished(&job),
                    Err(err) => {
                        error!(job_id = %job_id, error = %err, "failed to mark job incomplete")
                    }
                }
                Err(FerryError::InvariantViolation(reason))
            }
            result => result,
        }
    }

    async fn drive(&self, job_id: JobId, cancel: &CancellationToken) -> FerryResult<Job> {
        loop {
            let job = self
                .store_call("get_job", || self.store.get_job(job_id))
                .await?;
            if job.status.is_terminal() {
                return Ok(job);
            }

            let attempts = self
                .store_call("list_attempts", || self.store.list_attempts(job_id))
                .await?;
            let last = attempts.last();

            if let Some(abandoned) = last.filter(|attempt| attempt.status == AttemptStatus::Running)
            {
                self.reconcile_abandoned(&job, abandoned).await?;
                continue;
            }

            match last.map(|attempt| attempt.status) {
                Some(AttemptStatus::Succeeded) => {
                    return self.finish(&job, JobStatus::Succeeded, None).await
                }
                Some(AttemptStatus::Cancelled) => {
                    return self
                        .finish(&job, JobStatus::Cancelled, Some(CANCELLED_REASON.into()))
                        .await
                }
                _ => {}
            }

            match cancel.reason() {
                Some(CancelReason::Requested) => {
                    return self
                        .finish(&job, JobStatus::Cancelled, Some(CANCELLED_REASON.into()))
                        .await
                }
                Some(CancelReason::Shutdown) => return Err(FerryError::ShuttingDown),
                None => {}
            }

            if let Some(failed) = last {
                let attempts_made = attempts.len() as u32;
                match self.retry.decide(job.operation, attempts_made) {
                    RetryDecision::GiveUp => {
                        let reason = failure_summary(failed, attempts_made);
                        info!(job_id = %job.id, attempts = attempts_made, "retry budget exhausted");
                        return self.finish(&job, JobStatus::Failed, Some(reason)).await;
                    }
                    RetryDecision::Retry { delay } => {
                        info!(
                            job_id = %job.id,
                            next_attempt = attempts_made,
                            delay_ms = delay.as_millis() as u64,
                            "scheduling retry"
                        );
                        self.events.emit(
                            job.id,
                            JobEventPayload::RetryScheduled {
                                next_attempt: attempts_made,
                                delay_ms: delay.as_millis() as u64,
                            },
                        );
                        if !delay.is_zero() {
                            tokio::select! {
                                _ = cancel.cancelled() => continue,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }

            self.run_attempt(&job, attempts.len() as u32, cancel).await?;
        }
    }

    async fn run_attempt(
        &self,
        job: &Job,
        number: u32,
        cancel: &CancellationToken,
    ) -> FerryResult<AttemptOutcome> {
        let job = self
            .store_call("transition_job", || {
                self.store.transition_job(job.id, JobStatus::Running, None)
            })
            .await?;
        self.events.emit(
            job.id,
            JobEventPayload::StatusChanged {
                status: JobStatus::Running,
            },
        );

        let job_id = job.id;
        let attempt = self
            .write_once(
                "create_attempt",
                || self.store.create_attempt(job_id),
                || async move {
                    let attempts = self.store.list_attempts(job_id).await?;
                    Ok(attempts
                        .into_iter()
                        .find(|attempt| attempt.number == number))
                },
            )
            .await?;
        let checkpoint = self
            .store_call("latest_checkpoint", || self.store.latest_checkpoint(job.id))
            .await?;

        info!(
            job_id = %job.id,
            attempt = attempt.number,
            from_checkpoint = checkpoint.is_some(),
            "starting attempt"
        );
        self.supervisor.run(&job, &attempt, checkpoint, cancel).await
    }

    /// Clean up after an attempt whose orchestrator died mid-flight.
    async fn reconcile_abandoned(&self, job: &Job, attempt: &Attempt) -> FerryResult<()> {
        let unit_id = attempt
            .unit_id
            .clone()
            .unwrap_or_else(|| unit_id_for(job.id, attempt.number));
        warn!(
            job_id = %job.id,
            attempt = attempt.number,
            unit_id = %unit_id,
            "reconciling abandoned attempt"
        );

        self.substrate
            .destroy(&UnitHandle::new(unit_id.clone()))
            .await
            .map_err(|err| {
                FerryError::Transient(format!("could not destroy residual unit {unit_id}: {err}"))
            })?;

        let outcome = AttemptOutcome::failed(
            attempt.output.clone(),
            FailureKind::Abandoned,
            "orchestrator stopped while the attempt was running",
        );
        let recorded = self
            .write_once(
                "record_attempt_outcome",
                || self.store.record_attempt_outcome(attempt.id, &outcome),
                || async move {
                    let attempts = self.store.list_attempts(job.id).await?;
                    Ok(attempts.into_iter().find(|recorded| {
                        recorded.id == attempt.id && recorded.status == AttemptStatus::Failed
                    }))
                },
            )
            .await?;

        let elapsed = (Utc::now() - attempt.started_at)
            .to_std()
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default();
        telemetry::record_attempt_finished(
            job.id,
            attempt.number,
            job.operation.as_str(),
            recorded.status.as_str(),
            elapsed,
        );
        self.events.emit(
            job.id,
            JobEventPayload::AttemptFinished {
                attempt_number: attempt.number,
                status: recorded.status,
                failure_kind: Some(FailureKind::Abandoned),
            },
        );
        Ok(())
    }

    async fn finish(&self, job: &Job, status: JobStatus, reason: Option<String>) -> FerryResult<Job> {
        let job_id = job.id;
        let job = self
            .write_once(
                "transition_job",
                || self.store.transition_job(job_id, status, reason.clone()),
                || async move {
                    let job = self.store.get_job(job_id).await?;
                    Ok((job.status == status).then_some(job))
                },
            )
            .await?;
        self.events
            .emit(job.id, JobEventPayload::StatusChanged { status });
        self.announce_finished(&job);
        Ok(job)
    }

    fn announce_finished(&self, job: &Job) {
        telemetry::record_job_finished(job.id, job.operation.as_str(), job.status.as_str());
        self.events.emit(
            job.id,
            JobEventPayload::JobFinished {
                status: job.status,
                reason: job.failure_reason.clone(),
            },
        );
    }

    async fn store_call<T, F, Fut>(&self, operation: &str, f: F) -> FerryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        retry_transient(&self.store_retry, operation, f)
            .await
            .map_err(FerryError::from)
    }

    async fn write_once<T, W, WFut, R, RFut>(
        &self,
        operation: &str,
        write: W,
        recover: R,
    ) -> FerryResult<T>
    where
        W: FnMut() -> WFut,
        WFut: Future<Output = StoreResult<T>>,
        R: FnMut() -> RFut,
        RFut: Future<Output = StoreResult<Option<T>>>,
    {
        retry_write(&self.store_retry, operation, write, recover)
            .await
            .map_err(FerryError::from)
    }
}

fn failure_summary(attempt: &Attempt, attempts_made: u32) -> String {
    let detail = attempt
        .output
        .message
        .clone()
        .or_else(|| attempt.output.failure_kind.map(|kind| kind.to_string()))
        .unwrap_or_else(|| "unknown failure".to_string());
    format!("failed after {attempts_made} attempt(s); last: {detail}")
}
