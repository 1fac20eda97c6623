use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::cancel::{CancelReason, CancellationToken};
use crate::error::{FerryError, FerryResult, StoreResult};
use crate::events::{EventBus, JobEventPayload};
use crate::job::{
    Attempt, AttemptOutcome, AttemptOutput, AttemptStatus, Checkpoint, FailureKind, Job,
};
use crate::protocol::{LogLevel, ProtocolEvent, ProtocolReader, TraceEvent, DEFAULT_MAX_LINE_BYTES};
use crate::retry::{retry_transient, retry_write, StoreRetryConfig};
use crate::store::JobStore;
use crate::substrate::{ExecutionSubstrate, UnitExit, UnitHandle, UnitSpec};
use crate::telemetry;

/// Timing and buffering knobs for supervising one attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Longest silence tolerated from a unit before it is considered hung.
    pub heartbeat_timeout_ms: u64,
    /// Absolute wall-time limit of one attempt.
    pub attempt_timeout_ms: u64,
    /// Time between the graceful stop signal and destroying the unit.
    pub termination_grace_ms: u64,
    /// How long to wait for the exit status once the unit closed its output.
    pub exit_wait_ms: u64,
    /// Protocol events buffered between the stream reader and the supervisor.
    pub event_buffer: usize,
    pub max_line_bytes: usize,
    pub store_retry: StoreRetryConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 600_000,
            attempt_timeout_ms: 86_400_000,
            termination_grace_ms: 10_000,
            exit_wait_ms: 30_000,
            event_buffer: 64,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            store_retry: StoreRetryConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn with_heartbeat_timeout(mut self, ms: u64) -> Self {
        self.heartbeat_timeout_ms = ms;
        self
    }

    pub fn with_attempt_timeout(mut self, ms: u64) -> Self {
        self.attempt_timeout_ms = ms;
        self
    }

    pub fn with_termination_grace(mut self, ms: u64) -> Self {
        self.termination_grace_ms = ms;
        self
    }

    pub fn with_exit_wait(mut self, ms: u64) -> Self {
        self.exit_wait_ms = ms;
        self
    }

    pub fn with_event_buffer(mut self, events: usize) -> Self {
        self.event_buffer = events;
        self
    }

    pub fn with_store_retry(mut self, store_retry: StoreRetryConfig) -> Self {
        self.store_retry = store_retry;
        self
    }

    fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    fn exit_wait(&self) -> Duration {
        Duration::from_millis(self.exit_wait_ms)
    }
}

/// Why the watch loop stopped.
enum Ending {
    OutputClosed,
    DeadlineExceeded,
    HeartbeatLapsed,
    Cancelled(CancelReason),
    StoreFailed(FerryError),
}

/// What the watch loop has learned from the unit so far.
#[derive(Default)]
struct Watch {
    progress: AttemptOutput,
    error_trace: Option<String>,
    /// Sequence of the last checkpoint this attempt persisted.
    last_sequence: Option<u64>,
}

/// Runs one attempt of a job on an execution unit and records its outcome.
///
/// The supervisor persists every STATE message before reading the next one
/// and writes the attempt outcome to the store before returning it. Messages
/// already read when the unit is stopped are still handled, so no emitted
/// checkpoint is dropped. The unit is destroyed on every path out of
/// [`run`](Self::run).
pub struct AttemptSupervisor {
    store: Arc<dyn JobStore>,
    substrate: Arc<dyn ExecutionSubstrate>,
    events: Arc<EventBus>,
    config: SupervisorConfig,
}

impl fmt::Debug for AttemptSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptSupervisor")
            .field("substrate", &self.substrate.name())
            .field("config", &self.config)
            .finish()
    }
}

impl AttemptSupervisor {
    pub fn new(
        store: Arc<dyn JobStore>,
        substrate: Arc<dyn ExecutionSubstrate>,
        events: Arc<EventBus>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            substrate,
            events,
            config,
        }
    }

    /// Supervise `attempt` until it reaches a terminal outcome.
    ///
    /// Attempt-level failures (start failure, non-zero exit, ERROR trace,
    /// timeouts) are returned as `Ok` outcomes. `Err` means the outcome
    /// could not be recorded: the store stayed unavailable, an invariant was
    /// broken, or the dispatcher is shutting down. In those cases the attempt
    /// stays `RUNNING` in the store and is reconciled when the job resumes.
    pub async fn run(
        &self,
        job: &Job,
        attempt: &Attempt,
        checkpoint: Option<Checkpoint>,
        cancel: &CancellationToken,
    ) -> FerryResult<AttemptOutcome> {
        let spec = UnitSpec::for_attempt(job, attempt, checkpoint);
        let span = telemetry::attempt_span(job.id, attempt.number, &spec.unit_id);
        self.supervise(job, attempt, spec, cancel)
            .instrument(span)
            .await
    }

    async fn supervise(
        &self,
        job: &Job,
        attempt: &Attempt,
        spec: UnitSpec,
        cancel: &CancellationToken,
    ) -> FerryResult<AttemptOutcome> {
        let started = Instant::now();
        let handle = UnitHandle::new(spec.unit_id.clone());

        self.store_write("set_attempt_unit", || {
            self.store.set_attempt_unit(attempt.id, &spec.unit_id)
        })
        .await?;
        self.events.emit(
            job.id,
            JobEventPayload::AttemptStarted {
                attempt_id: attempt.id,
                attempt_number: attempt.number,
                unit_id: spec.unit_id.clone(),
            },
        );

        match cancel.reason() {
            Some(CancelReason::Shutdown) => return Err(FerryError::ShuttingDown),
            Some(CancelReason::Requested) => {
                let outcome = AttemptOutcome::cancelled(AttemptOutput::default());
                return self.conclude(job, attempt, outcome, started).await;
            }
            None => {}
        }

        if let Err(err) = self.substrate.start(&spec).await {
            warn!(error = %err, substrate = self.substrate.name(), "unit failed to start");
            self.destroy(&handle).await;
            let outcome = AttemptOutcome::failed(
                AttemptOutput::default(),
                FailureKind::StartFailed,
                err.to_string(),
            );
            return self.conclude(job, attempt, outcome, started).await;
        }
        debug!(substrate = self.substrate.name(), "unit started");

        let output = match self.substrate.attach_output(&handle).await {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "failed to attach to unit output");
                let mut progress = AttemptOutput::default();
                progress.exit_code = self.terminate(&handle).await;
                let outcome =
                    AttemptOutcome::failed(progress, FailureKind::StreamFailed, err.to_string());
                return self.conclude(job, attempt, outcome, started).await;
            }
        };

        let (tx, mut rx) = mpsc::channel(self.config.event_buffer.max(1));
        let reader = ProtocolReader::new(BufReader::new(output))
            .with_max_line_bytes(self.config.max_line_bytes);
        let reader_task = tokio::spawn(async move { reader.forward(&tx).await });

        let mut watch = Watch::default();

        let heartbeat_timeout = self.config.heartbeat_timeout();
        let deadline = tokio::time::sleep(self.config.attempt_timeout());
        tokio::pin!(deadline);
        let heartbeat = tokio::time::sleep(heartbeat_timeout);
        tokio::pin!(heartbeat);

        // Queued events win over the heartbeat: silence is measured from the
        // last event handled, not from the last one read.
        let ending = loop {
            tokio::select! {
                biased;
                reason = cancel.cancelled() => break Ending::Cancelled(reason),
                _ = &mut deadline => break Ending::DeadlineExceeded,
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Err(err) = self.handle_event(job, attempt, event, &mut watch).await {
                            break Ending::StoreFailed(err);
                        }
                        heartbeat.as_mut().reset(Instant::now() + heartbeat_timeout);
                    }
                    None => break Ending::OutputClosed,
                },
                _ = &mut heartbeat => break Ending::HeartbeatLapsed,
            }
        };

        if !matches!(ending, Ending::OutputClosed) {
            rx.close();
            reader_task.abort();
        }

        let ending = match ending {
            stopped @ (Ending::Cancelled(_) | Ending::DeadlineExceeded | Ending::HeartbeatLapsed) => {
                match self.drain_queued(job, attempt, &mut rx, &mut watch).await {
                    Ok(()) => stopped,
                    Err(err) => Ending::StoreFailed(err),
                }
            }
            other => other,
        };

        let Watch {
            mut progress,
            error_trace,
            ..
        } = watch;
        let outcome = match ending {
            Ending::OutputClosed => {
                let read_error = match reader_task.await {
                    Ok(Ok(lines)) => {
                        trace!(lines, "unit output closed");
                        None
                    }
                    Ok(Err(err)) => Some(err.to_string()),
                    Err(err) => Some(err.to_string()),
                };
                self.after_output_closed(&handle, progress, error_trace, read_error)
                    .await
            }
            Ending::Cancelled(CancelReason::Shutdown) => {
                info!("dispatcher shutting down, abandoning attempt");
                self.destroy(&handle).await;
                return Err(FerryError::ShuttingDown);
            }
            Ending::StoreFailed(err) => {
                error!(error = %err, "could not persist attempt progress, stopping unit");
                self.destroy(&handle).await;
                return Err(err);
            }
            Ending::Cancelled(CancelReason::Requested) => {
                info!("cancellation requested, stopping unit");
                progress.exit_code = self.terminate(&handle).await;
                AttemptOutcome::cancelled(progress)
            }
            Ending::DeadlineExceeded => {
                warn!(
                    attempt_timeout_ms = self.config.attempt_timeout_ms,
                    "attempt deadline exceeded"
                );
                progress.exit_code = self.terminate(&handle).await;
                AttemptOutcome::failed(
                    progress,
                    FailureKind::TimedOut,
                    format!(
                        "attempt exceeded its {} ms deadline",
                        self.config.attempt_timeout_ms
                    ),
                )
            }
            Ending::HeartbeatLapsed => {
                warn!(
                    heartbeat_timeout_ms = self.config.heartbeat_timeout_ms,
                    "no output from unit, heartbeat lapsed"
                );
                progress.exit_code = self.terminate(&handle).await;
                AttemptOutcome::failed(
                    progress,
                    FailureKind::HeartbeatLapsed,
                    format!(
                        "no output for {} ms",
                        self.config.heartbeat_timeout_ms
                    ),
                )
            }
        };

        self.conclude(job, attempt, outcome, started).await
    }

    /// Handle the events the reader queued before the watch loop stopped.
    async fn drain_queued(
        &self,
        job: &Job,
        attempt: &Attempt,
        rx: &mut mpsc::Receiver<ProtocolEvent>,
        watch: &mut Watch,
    ) -> FerryResult<()> {
        let mut drained = 0u64;
        while let Ok(event) = rx.try_recv() {
            self.handle_event(job, attempt, event, watch).await?;
            drained += 1;
        }
        if drained > 0 {
            debug!(drained, "handled events queued before the unit was stopped");
        }
        Ok(())
    }

    async fn handle_event(
        &self,
        job: &Job,
        attempt: &Attempt,
        event: ProtocolEvent,
        watch: &mut Watch,
    ) -> FerryResult<()> {
        let progress = &mut watch.progress;
        match event {
            ProtocolEvent::Record(_) => progress.records_emitted += 1,
            ProtocolEvent::State(checkpoint) => {
                let last_sequence = watch.last_sequence;
                let record = self
                    .write_once(
                        "record_checkpoint",
                        || self.store.record_checkpoint(job.id, checkpoint.clone()),
                        // A record of this attempt newer than the last one we
                        // saw can only be the write that reported an outage.
                        || async move {
                            let history = self.store.checkpoint_history(job.id).await?;
                            Ok(history.into_iter().last().filter(|record| {
                                record.attempt_id == attempt.id
                                    && Some(record.sequence) > last_sequence
                            }))
                        },
                    )
                    .await?;
                watch.last_sequence = Some(record.sequence);
                progress.checkpoints_persisted += 1;
                telemetry::record_checkpoint_persisted(
                    job.id,
                    record.sequence,
                    job.operation.as_str(),
                );
                self.events.emit(
                    job.id,
                    JobEventPayload::CheckpointPersisted {
                        attempt_number: attempt.number,
                        sequence: record.sequence,
                    },
                );
            }
            ProtocolEvent::Log { level, message } => {
                log_connector_line(level, &message);
                self.events.emit(
                    job.id,
                    JobEventPayload::AttemptLog {
                        attempt_number: attempt.number,
                        level,
                        message,
                    },
                );
            }
            ProtocolEvent::Trace(TraceEvent::Error {
                message,
                failure_type,
                ..
            }) => {
                warn!(
                    failure_type = failure_type.as_deref().unwrap_or("unknown"),
                    "connector reported an error: {message}"
                );
                watch.error_trace.get_or_insert(message);
            }
            ProtocolEvent::Trace(other) => trace!(trace = ?other, "connector trace"),
            ProtocolEvent::ConnectionStatus { status, message } => {
                info!(
                    status = %status,
                    message = message.as_deref().unwrap_or(""),
                    "connection status reported"
                );
                progress.connection_status = Some(status);
            }
            ProtocolEvent::ParseError {
                line_number,
                error,
                excerpt,
            } => {
                progress.parse_errors += 1;
                warn!(line_number, error = %error, excerpt = %excerpt, "unparseable protocol line");
                self.events.emit(
                    job.id,
                    JobEventPayload::AttemptLog {
                        attempt_number: attempt.number,
                        level: LogLevel::Warn,
                        message: format!("unparseable line {line_number}: {error}"),
                    },
                );
            }
        }
        Ok(())
    }

    async fn after_output_closed(
        &self,
        handle: &UnitHandle,
        mut progress: AttemptOutput,
        error_trace: Option<String>,
        read_error: Option<String>,
    ) -> AttemptOutcome {
        match self
            .substrate
            .await_exit(handle, self.config.exit_wait())
            .await
        {
            Ok(UnitExit::Exited { code }) => {
                progress.exit_code = code;
                self.destroy(handle).await;
                classify_exit(progress, error_trace, read_error)
            }
            Ok(UnitExit::TimedOut) => {
                warn!(
                    exit_wait_ms = self.config.exit_wait_ms,
                    "unit closed its output but did not exit"
                );
                progress.exit_code = self.terminate(handle).await;
                match error_trace {
                    Some(message) => {
                        AttemptOutcome::failed(progress, FailureKind::ErrorTrace, message)
                    }
                    None => AttemptOutcome::failed(
                        progress,
                        FailureKind::StreamFailed,
                        format!(
                            "unit closed its output but did not exit within {} ms",
                            self.config.exit_wait_ms
                        ),
                    ),
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to collect unit exit status");
                progress.exit_code = self.terminate(handle).await;
                AttemptOutcome::failed(progress, FailureKind::StreamFailed, err.to_string())
            }
        }
    }

    /// Graceful stop, bounded wait, then destroy. Returns the exit code if
    /// the unit exited within the grace period.
    async fn terminate(&self, handle: &UnitHandle) -> Option<i32> {
        if let Err(err) = self.substrate.signal_terminate(handle).await {
            warn!(unit_id = %handle, error = %err, "failed to signal unit");
        }
        let code = match self
            .substrate
            .await_exit(handle, self.config.termination_grace())
            .await
        {
            Ok(UnitExit::Exited { code }) => code,
            Ok(UnitExit::TimedOut) => {
                debug!(unit_id = %handle, "grace period elapsed");
                None
            }
            Err(err) => {
                warn!(unit_id = %handle, error = %err, "failed to await unit exit");
                None
            }
        };
        self.destroy(handle).await;
        code
    }

    async fn destroy(&self, handle: &UnitHandle) {
        if let Err(err) = self.substrate.destroy(handle).await {
            warn!(unit_id = %handle, error = %err, "failed to destroy unit");
        }
    }

    async fn conclude(
        &self,
        job: &Job,
        attempt: &Attempt,
        outcome: AttemptOutcome,
        started: Instant,
    ) -> FerryResult<AttemptOutcome> {
        let status = outcome.status;
        let recorded = self
            .write_once(
                "record_attempt_outcome",
                || self.store.record_attempt_outcome(attempt.id, &outcome),
                || async move {
                    let attempts = self.store.list_attempts(job.id).await?;
                    Ok(attempts
                        .into_iter()
                        .find(|recorded| recorded.id == attempt.id && recorded.status == status))
                },
            )
            .await?;

        if let Some(message) = &outcome.output.message {
            if outcome.status != AttemptStatus::Succeeded {
                info!(
                    failure_kind = outcome
                        .output
                        .failure_kind
                        .map(|kind| kind.as_str())
                        .unwrap_or("none"),
                    "attempt ended: {message}"
                );
            }
        }
        telemetry::record_attempt_finished(
            job.id,
            attempt.number,
            job.operation.as_str(),
            recorded.status.as_str(),
            started.elapsed().as_secs_f64(),
        );
        self.events.emit(
            job.id,
            JobEventPayload::AttemptFinished {
                attempt_number: attempt.number,
                status: recorded.status,
                failure_kind: outcome.output.failure_kind,
            },
        );
        Ok(outcome)
    }

    async fn store_write<T, F, Fut>(&self, operation: &str, f: F) -> FerryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        retry_transient(&self.config.store_retry, operation, f)
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
        retry_write(&self.config.store_retry, operation, write, recover)
            .await
            .map_err(FerryError::from)
    }
}

/// Outcome of a unit that closed its output and exited on its own.
fn classify_exit(
    progress: AttemptOutput,
    error_trace: Option<String>,
    read_error: Option<String>,
) -> AttemptOutcome {
    if let Some(message) = error_trace {
        return AttemptOutcome::failed(progress, FailureKind::ErrorTrace, message);
    }
    match progress.exit_code {
        Some(0) => match read_error {
            None => AttemptOutcome::succeeded(progress),
            Some(err) => AttemptOutcome::failed(
                progress,
                FailureKind::StreamFailed,
                format!("reading unit output failed: {err}"),
            ),
        },
        Some(code) => AttemptOutcome::failed(
            progress,
            FailureKind::NonZeroExit,
            format!("unit exited with code {code}"),
        ),
        None => AttemptOutcome::failed(
            progress,
            FailureKind::NonZeroExit,
            "unit was killed by a signal",
        ),
    }
}

fn log_connector_line(level: LogLevel, message: &str) {
    match level {
        LogLevel::Fatal | LogLevel::Error => error!(target: "ferry::connector", "{message}"),
        LogLevel::Warn => warn!(target: "ferry::connector", "{message}"),
        LogLevel::Info => info!(target: "ferry::connector", "{message}"),
        LogLevel::Debug => debug!(target: "ferry::connector", "{message}"),
        LogLevel::Trace => trace!(target: "ferry::connector", "{message}"),
    }
}
