//! Tracing spans and metric recording for job lifecycle events.
//!
//! Every helper logs through `tracing`; with the `metrics` feature enabled
//! it also updates the Prometheus collectors in [`crate::metrics`].
//!
//! # Example
//!
//! ```ignore
//! use ferry::telemetry::{instrument_job, record_job_submitted};
//!
//! record_job_submitted(job_id, "sync", "sync");
//! instrument_job(job_id, "sync", orchestrator.run(job_id, &cancel)).await;
//! ```

use std::future::Future;
use tracing::instrument::Instrumented;
use tracing::{info_span, Instrument, Span};

use crate::job::JobId;

/// Span covering everything an orchestrator does for one job.
#[must_use]
pub fn job_span(job_id: JobId, pool: impl AsRef<str>) -> Span {
    info_span!(
        "ferry.job",
        job_id = %job_id,
        pool = %pool.as_ref(),
    )
}

/// Span covering one supervised attempt.
#[must_use]
pub fn attempt_span(job_id: JobId, attempt_number: u32, unit_id: impl AsRef<str>) -> Span {
    info_span!(
        "ferry.attempt",
        job_id = %job_id,
        attempt = attempt_number,
        unit_id = %unit_id.as_ref(),
    )
}

/// Span for admission decisions.
#[must_use]
pub fn admission_span(job_id: JobId, pool: impl AsRef<str>) -> Span {
    info_span!(
        "ferry.admission",
        job_id = %job_id,
        pool = %pool.as_ref(),
    )
}

/// Attach a job span to a future. The span is built eagerly, so the result
/// borrows nothing from `pool`.
pub fn instrument_job<F>(job_id: JobId, pool: &str, future: F) -> Instrumented<F>
where
    F: Future,
{
    future.instrument(job_span(job_id, pool))
}

pub fn record_job_submitted(job_id: JobId, pool: impl AsRef<str>, operation: impl AsRef<str>) {
    tracing::info!(
        job_id = %job_id,
        pool = %pool.as_ref(),
        operation = %operation.as_ref(),
        "job submitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted(pool.as_ref(), operation.as_ref());
}

/// Record a job reaching a terminal status.
pub fn record_job_finished(job_id: JobId, operation: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::info!(
        job_id = %job_id,
        operation = %operation.as_ref(),
        status = %status.as_ref(),
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(operation.as_ref(), status.as_ref());
}

/// Record the outcome and duration of one attempt.
pub fn record_attempt_finished(
    job_id: JobId,
    attempt_number: u32,
    operation: impl AsRef<str>,
    status: impl AsRef<str>,
    duration_secs: f64,
) {
    tracing::info!(
        job_id = %job_id,
        attempt = attempt_number,
        operation = %operation.as_ref(),
        status = %status.as_ref(),
        duration_secs,
        "attempt finished"
    );

    #[cfg(feature = "metrics")]
    {
        crate::metrics::record_attempt_finished(operation.as_ref(), status.as_ref());
        crate::metrics::observe_attempt_duration(
            operation.as_ref(),
            status.as_ref(),
            duration_secs,
        );
    }
}

pub fn record_checkpoint_persisted(job_id: JobId, sequence: u64, operation: impl AsRef<str>) {
    tracing::debug!(job_id = %job_id, sequence, "checkpoint persisted");

    #[cfg(feature = "metrics")]
    crate::metrics::record_checkpoint_persisted(operation.as_ref());
    #[cfg(not(feature = "metrics"))]
    let _ = operation;
}

/// Publish the current running/pending counts of a pool.
pub fn record_pool_utilization(pool: impl AsRef<str>, running: usize, pending: usize) {
    tracing::trace!(
        pool = %pool.as_ref(),
        running,
        pending,
        "pool utilization"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::set_pool_utilization(pool.as_ref(), running as f64, pending as f64);
}
