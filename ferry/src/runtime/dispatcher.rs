use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::admission::{Admission, AdmissionControl, PoolResolver, PoolUtilization};
use crate::cancel::{CancelReason, CancellationToken};
use crate::error::{FerryError, FerryResult, StoreResult};
use crate::events::{EventBus, JobEvent, JobEventPayload};
use crate::job::{
    Attempt, CheckpointRecord, ConnectionId, Job, JobConfig, JobId, JobStatus, JobStatusChange,
    NewJob, OperationKind,
};
use crate::retry::{retry_transient, retry_write, StoreRetryConfig};
use crate::store::JobStore;
use crate::telemetry;

use super::orchestrator::JobOrchestrator;

const SHUTDOWN_WAIT: Duration = Duration::from_secs(30);

struct RunningJob {
    pool: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Shared {
    store: Arc<dyn JobStore>,
    orchestrator: JobOrchestrator,
    admission: AdmissionControl,
    resolver: Arc<dyn PoolResolver>,
    events: Arc<EventBus>,
    store_retry: StoreRetryConfig,
    running: Mutex<HashMap<JobId, RunningJob>>,
    shutting_down: AtomicBool,
}

/// Front door of the engine: accepts jobs, enforces per-pool concurrency,
/// and runs one orchestrator task per admitted job.
///
/// Jobs over a pool's limit stay `PENDING` and are started in submission
/// order as slots free up.
///
/// # Example
///
/// ```ignore
/// let dispatcher = DispatcherBuilder::new(config)
///     .with_store(store)
///     .build()?;
/// dispatcher.resume().await?;
///
/// let job_id = dispatcher
///     .submit(connection_id, OperationKind::Sync, JobConfig::new("source-pg:1.0"))
///     .await?;
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Dispatcher");
        debug.field("orchestrator", &self.shared.orchestrator);
        debug.field("admission", &self.shared.admission);
        match self.shared.running.try_lock() {
            Some(running) => {
                debug.field("running_jobs", &running.len());
            }
            None => {
                debug.field("running_jobs", &"<locked>");
            }
        }
        debug.field(
            "shutting_down",
            &self.shared.shutting_down.load(Ordering::SeqCst),
        );
        debug.finish()
    }
}

impl Dispatcher {
    pub(crate) fn new(
        store: Arc<dyn JobStore>,
        orchestrator: JobOrchestrator,
        admission: AdmissionControl,
        resolver: Arc<dyn PoolResolver>,
        events: Arc<EventBus>,
        store_retry: StoreRetryConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                orchestrator,
                admission,
                resolver,
                events,
                store_retry,
                running: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Create a job and start it if its pool has room.
    ///
    /// Fails with [`FerryError::AlreadyRunning`] if the connection already
    /// has a `PENDING` or `RUNNING` job.
    pub async fn submit(
        &self,
        connection_id: ConnectionId,
        operation: OperationKind,
        config: JobConfig,
    ) -> FerryResult<JobId> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(FerryError::ShuttingDown);
        }

        let pool = self
            .shared
            .resolver
            .pool_for(connection_id, operation, &config);
        let new_job = NewJob {
            connection_id,
            operation,
            pool: pool.clone(),
            config,
        };
        let job = self
            .shared
            .store_call("create_job", || self.shared.store.create_job(new_job.clone()))
            .await?;

        telemetry::record_job_submitted(job.id, &pool, operation.as_str());
        self.shared.events.emit(
            job.id,
            JobEventPayload::Submitted {
                connection_id,
                operation,
                pool: pool.clone(),
            },
        );

        self.shared.admit(job.id, &pool);
        Ok(job.id)
    }

    /// Cancel a job.
    ///
    /// A running job has its orchestrator signalled and reaches `CANCELLED`
    /// once its unit is torn down. A queued job is withdrawn and marked
    /// `CANCELLED` right away. Cancelling a terminal job does nothing.
    pub async fn cancel(&self, job_id: JobId) -> FerryResult<()> {
        if self.shared.signal_running(job_id) {
            return Ok(());
        }

        let job = self
            .shared
            .store_call("get_job", || self.shared.store.get_job(job_id))
            .await?;
        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "cancel ignored, job already terminal");
            return Ok(());
        }

        if !self.shared.admission.withdraw(&job.pool, job_id) && self.shared.signal_running(job_id)
        {
            // Admitted between the two checks.
            return Ok(());
        }

        // Not owned by any orchestrator task here. Drive it to CANCELLED
        // inline, which also reconciles an abandoned attempt.
        let token = CancellationToken::new();
        token.cancel(CancelReason::Requested);
        self.shared.orchestrator.run(job_id, &token).await?;
        self.shared.publish_utilization(&job.pool);
        Ok(())
    }

    pub async fn job(&self, job_id: JobId) -> FerryResult<Job> {
        self.shared
            .store_call("get_job", || self.shared.store.get_job(job_id))
            .await
    }

    pub async fn attempts(&self, job_id: JobId) -> FerryResult<Vec<Attempt>> {
        self.shared
            .store_call("list_attempts", || self.shared.store.list_attempts(job_id))
            .await
    }

    pub async fn status_history(&self, job_id: JobId) -> FerryResult<Vec<JobStatusChange>> {
        self.shared
            .store_call("job_status_history", || {
                self.shared.store.job_status_history(job_id)
            })
            .await
    }

    pub async fn checkpoints(&self, job_id: JobId) -> FerryResult<Vec<CheckpointRecord>> {
        self.shared
            .store_call("checkpoint_history", || {
                self.shared.store.checkpoint_history(job_id)
            })
            .await
    }

    /// Stream of lifecycle and connector log events for every job.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.events.subscribe()
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.shared.events)
    }

    pub fn pool_utilization(&self, pool: &str) -> PoolUtilization {
        self.shared.admission.utilization(pool)
    }

    /// Pick up every non-terminal job found in the store after a restart.
    ///
    /// `RUNNING` jobs are re-admitted first; those that no longer fit in
    /// their pool are moved back to `PENDING` and queued. `PENDING` jobs are
    /// queued after them in id order. Jobs this dispatcher already tracks
    /// are left alone. Returns the number of jobs picked up.
    pub async fn resume(&self) -> FerryResult<usize> {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return Err(FerryError::ShuttingDown);
        }

        let active = self
            .shared
            .store_call("list_active_jobs", || self.shared.store.list_active_jobs())
            .await?;
        let (running, pending): (Vec<Job>, Vec<Job>) = active
            .into_iter()
            .partition(|job| job.status == JobStatus::Running);

        let mut resumed = 0;
        for job in running {
            if self.shared.is_tracked(&job) {
                continue;
            }
            resumed += 1;
            if !self.shared.has_capacity(&job.pool) {
                self.move_back_to_pending(&job).await?;
                self.shared.admit(job.id, &job.pool);
                continue;
            }
            info!(job_id = %job.id, pool = %job.pool, "resuming running job");
            if let Admission::Queued { .. } = self.shared.admit(job.id, &job.pool) {
                // The pool filled up since the capacity check. A job that is
                // no longer queued was handed a slot and keeps RUNNING.
                if self.shared.admission.withdraw(&job.pool, job.id) {
                    self.move_back_to_pending(&job).await?;
                    self.shared.admit(job.id, &job.pool);
                }
            }
        }

        for job in pending {
            if self.shared.is_tracked(&job) {
                continue;
            }
            resumed += 1;
            self.shared.admit(job.id, &job.pool);
        }

        info!(resumed, "resume complete");
        Ok(resumed)
    }

    /// Move a resumed `RUNNING` job that has no slot back to `PENDING`. The
    /// write lands before the job is queued, so it never overwrites the
    /// status set by the job's own orchestrator.
    async fn move_back_to_pending(&self, job: &Job) -> FerryResult<()> {
        info!(
            job_id = %job.id,
            pool = %job.pool,
            "no capacity for resumed job, moving it back to pending"
        );
        let reason = Some("waiting for capacity after restart".to_string());
        let job_id = job.id;
        let store = &self.shared.store;
        self.shared
            .write_once(
                "transition_job",
                || store.transition_job(job_id, JobStatus::Pending, reason.clone()),
                || async move {
                    let current = store.get_job(job_id).await?;
                    Ok((current.status == JobStatus::Pending).then_some(current))
                },
            )
            .await?;
        self.shared.events.emit(
            job.id,
            JobEventPayload::StatusChanged {
                status: JobStatus::Pending,
            },
        );
        Ok(())
    }

    /// Stop every orchestrator task without cancelling its job.
    ///
    /// Units are destroyed and their attempts left `RUNNING`; the next
    /// [`resume`](Self::resume) reconciles them. New submissions are refused
    /// from now on.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        info!("shutting down dispatcher");
        self.shared.shutting_down.store(true, Ordering::SeqCst);

        let handles: Vec<(JobId, JoinHandle<()>)> = {
            let mut running = self.shared.running.lock();
            running
                .iter_mut()
                .filter_map(|(job_id, entry)| {
                    entry.cancel.cancel(CancelReason::Shutdown);
                    entry.handle.take().map(|handle| (*job_id, handle))
                })
                .collect()
        };

        for (job_id, handle) in handles {
            match tokio::time::timeout(SHUTDOWN_WAIT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(job_id = %job_id, "orchestrator task failed: {err:?}"),
                Err(_) => warn!(job_id = %job_id, "orchestrator task timed out during shutdown"),
            }
        }

        info!("dispatcher shutdown complete");
        Ok(())
    }
}

impl Shared {
    /// Admit `job_id` to `pool`, starting its orchestrator if a slot is free.
    ///
    /// The slot is taken and the job registered as running in one critical
    /// section of the running table, so [`Dispatcher::cancel`] always finds a
    /// job that has left the queue.
    fn admit(self: &Arc<Self>, job_id: JobId, pool: &str) -> Admission {
        let _span = telemetry::admission_span(job_id, pool).entered();
        let (admission, cancel) = {
            let mut running = self.running.lock();
            let admission = self.admission.admit(pool, job_id);
            let cancel = match admission {
                Admission::Admitted => track(&mut running, job_id, pool),
                Admission::Queued { .. } => None,
            };
            (admission, cancel)
        };
        match admission {
            Admission::Admitted => {
                debug!("job admitted");
                self.events.emit(
                    job_id,
                    JobEventPayload::Admitted {
                        pool: pool.to_string(),
                    },
                );
                if let Some(cancel) = cancel {
                    self.spawn_orchestrator(job_id, pool, cancel);
                }
            }
            Admission::Queued { position } => {
                debug!(position, "pool full, job queued");
                self.events.emit(
                    job_id,
                    JobEventPayload::Queued {
                        pool: pool.to_string(),
                        position,
                    },
                );
            }
        }
        self.publish_utilization(pool);
        admission
    }

    fn spawn_orchestrator(self: &Arc<Self>, job_id: JobId, pool: &str, cancel: CancellationToken) {
        let shared = Arc::clone(self);
        let pool_name = pool.to_string();
        let task = async move {
            match shared.orchestrator.run(job_id, &cancel).await {
                Ok(job) => debug!(status = %job.status, "orchestrator finished"),
                Err(FerryError::ShuttingDown) => debug!("orchestrator stopped for shutdown"),
                Err(FerryError::InvariantViolation(reason)) => {
                    error!(reason = %reason, "orchestrator halted")
                }
                Err(err) => warn!(
                    error = %err,
                    "orchestrator stopped, job left resumable"
                ),
            }
            shared.on_finished(job_id, &pool_name);
        };
        let handle = tokio::spawn(telemetry::instrument_job(job_id, pool, task));

        if let Some(entry) = self.running.lock().get_mut(&job_id) {
            entry.handle = Some(handle);
        }
    }

    fn on_finished(self: &Arc<Self>, job_id: JobId, pool: &str) {
        let handover = {
            let mut running = self.running.lock();
            running.remove(&job_id);
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            self.admission
                .release(pool, job_id)
                .and_then(|next| track(&mut running, next, pool).map(|cancel| (next, cancel)))
        };
        if let Some((next, cancel)) = handover {
            debug!(job_id = %next, pool, "slot handed to queued job");
            self.events.emit(
                next,
                JobEventPayload::Admitted {
                    pool: pool.to_string(),
                },
            );
            self.spawn_orchestrator(next, pool, cancel);
        }
        self.publish_utilization(pool);
    }

    /// Signal the orchestrator owning `job_id`, if any.
    fn signal_running(&self, job_id: JobId) -> bool {
        match self.running.lock().get(&job_id) {
            Some(entry) => {
                if entry.cancel.cancel(CancelReason::Requested) {
                    info!(job_id = %job_id, pool = %entry.pool, "cancellation requested");
                }
                true
            }
            None => false,
        }
    }

    /// Whether `pool` has a free slot and nobody waiting for it.
    fn has_capacity(&self, pool: &str) -> bool {
        let utilization = self.admission.utilization(pool);
        utilization.pending == 0 && utilization.running < utilization.limit
    }

    fn is_tracked(&self, job: &Job) -> bool {
        self.running.lock().contains_key(&job.id)
            || self.admission.queued(&job.pool).contains(&job.id)
    }

    fn publish_utilization(&self, pool: &str) {
        let utilization = self.admission.utilization(pool);
        telemetry::record_pool_utilization(pool, utilization.running, utilization.pending);
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

/// Register `job_id` as owned by this dispatcher. Returns `None` if it
/// already is.
fn track(
    running: &mut HashMap<JobId, RunningJob>,
    job_id: JobId,
    pool: &str,
) -> Option<CancellationToken> {
    if running.contains_key(&job_id) {
        return None;
    }
    let cancel = CancellationToken::new();
    running.insert(
        job_id,
        RunningJob {
            pool: pool.to_string(),
            cancel: cancel.clone(),
            handle: None,
        },
    );
    Some(cancel)
}
