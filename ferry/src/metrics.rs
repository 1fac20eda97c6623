//! Prometheus metrics for job orchestration.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `ferry_jobs_submitted_total` - Jobs accepted by the dispatcher
//! - `ferry_jobs_finished_total` - Jobs reaching a terminal status
//! - `ferry_attempts_finished_total` - Attempts reaching a terminal status
//! - `ferry_checkpoints_persisted_total` - STATE messages persisted
//!
//! ## Gauges
//! - `ferry_pool_running` - Jobs holding a slot per pool
//! - `ferry_pool_pending` - Jobs queued per pool
//!
//! ## Histograms
//! - `ferry_attempt_duration_seconds` - Wall time of each attempt
#![cfg(feature = "metrics")]

use prometheus::{exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry};
use std::sync::LazyLock;

/// Registry holding every ferry collector.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("ferry_jobs_submitted_total", "Jobs accepted by the dispatcher");
    CounterVec::new(opts, &["pool", "operation"])
        .expect("ferry_jobs_submitted_total metric creation failed")
});

pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "ferry_jobs_finished_total",
        "Jobs reaching a terminal status",
    );
    CounterVec::new(opts, &["operation", "status"])
        .expect("ferry_jobs_finished_total metric creation failed")
});

pub static ATTEMPTS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "ferry_attempts_finished_total",
        "Attempts reaching a terminal status",
    );
    CounterVec::new(opts, &["operation", "status"])
        .expect("ferry_attempts_finished_total metric creation failed")
});

pub static CHECKPOINTS_PERSISTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "ferry_checkpoints_persisted_total",
        "Checkpoints persisted from connector STATE messages",
    );
    CounterVec::new(opts, &["operation"])
        .expect("ferry_checkpoints_persisted_total metric creation failed")
});

pub static POOL_RUNNING: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("ferry_pool_running", "Jobs holding a slot in the pool");
    GaugeVec::new(opts, &["pool"]).expect("ferry_pool_running metric creation failed")
});

pub static POOL_PENDING: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("ferry_pool_pending", "Jobs waiting for a slot in the pool");
    GaugeVec::new(opts, &["pool"]).expect("ferry_pool_pending metric creation failed")
});

/// Labels: `operation`, `status`.
pub static ATTEMPT_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.1, 2.0, 18).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "ferry_attempt_duration_seconds",
        "Attempt wall time in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["operation", "status"])
        .expect("ferry_attempt_duration_seconds metric creation failed")
});

/// Register all collectors with [`REGISTRY`]. Idempotent.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(ATTEMPTS_FINISHED_TOTAL.clone()),
        Box::new(CHECKPOINTS_PERSISTED_TOTAL.clone()),
        Box::new(POOL_RUNNING.clone()),
        Box::new(POOL_PENDING.clone()),
        Box::new(ATTEMPT_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted") {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_submitted(pool: &str, operation: &str) {
    JOBS_SUBMITTED_TOTAL
        .with_label_values(&[pool, operation])
        .inc();
}

pub fn record_job_finished(operation: &str, status: &str) {
    JOBS_FINISHED_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

pub fn record_attempt_finished(operation: &str, status: &str) {
    ATTEMPTS_FINISHED_TOTAL
        .with_label_values(&[operation, status])
        .inc();
}

pub fn record_checkpoint_persisted(operation: &str) {
    CHECKPOINTS_PERSISTED_TOTAL
        .with_label_values(&[operation])
        .inc();
}

pub fn set_pool_utilization(pool: &str, running: f64, pending: f64) {
    POOL_RUNNING.with_label_values(&[pool]).set(running);
    POOL_PENDING.with_label_values(&[pool]).set(pending);
}

pub fn observe_attempt_duration(operation: &str, status: &str, duration_secs: f64) {
    ATTEMPT_DURATION_SECONDS
        .with_label_values(&[operation, status])
        .observe(duration_secs);
}

/// Encode every registered metric in the Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
