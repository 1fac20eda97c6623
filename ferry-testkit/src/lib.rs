//! Test support for ferry: a scripted execution substrate, a store that
//! injects outages, protocol line builders and fast configuration fixtures.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ferry::admission::PoolConfig;
use ferry::config::FerryConfig;
use ferry::job::{Job, JobId, JobStatus};
use ferry::retry::{BackoffStrategy, RetryConfig, StoreRetryConfig};
use ferry::runtime::{Dispatcher, DispatcherBuilder, SupervisorConfig};
use ferry::store::JobStore;

pub mod lines;
pub mod store;
pub mod substrate;

pub use lines::*;
pub use store::FlakyStore;
pub use substrate::{ScriptedSubstrate, UnitScript, UnitStep};

/// Supervisor timings short enough for tests.
pub fn fast_supervisor_config() -> SupervisorConfig {
    SupervisorConfig::default()
        .with_heartbeat_timeout(2_000)
        .with_attempt_timeout(10_000)
        .with_termination_grace(50)
        .with_exit_wait(1_000)
        .with_store_retry(StoreRetryConfig {
            max_tries: 5,
            backoff: BackoffStrategy::Fixed { delay_ms: 5 },
        })
}

/// Configuration with millisecond backoffs and the given pool limit.
pub fn fast_config(pool_limit: usize) -> FerryConfig {
    FerryConfig::default()
        .with_supervisor(fast_supervisor_config())
        .with_retry(RetryConfig::default().with_backoff(BackoffStrategy::Fixed { delay_ms: 10 }))
        .with_pools(PoolConfig::with_default(pool_limit))
}

/// Dispatcher over `store` and a scripted substrate.
pub fn dispatcher_with(
    store: Arc<dyn JobStore>,
    substrate: ScriptedSubstrate,
    config: FerryConfig,
) -> Dispatcher {
    DispatcherBuilder::new(config)
        .with_store(store)
        .with_substrate(Arc::new(substrate))
        .build()
        .expect("dispatcher dependencies are set")
}

/// Poll `check` every few milliseconds until it returns `Some`, or panic
/// after `timeout`.
pub async fn eventually<T, F, Fut>(timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let poll = async {
        loop {
            if let Some(value) = check().await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(timeout, poll)
        .await
        .expect("condition not met before timeout")
}

/// Wait until the job reaches `status`.
pub async fn wait_for_status(
    store: &dyn JobStore,
    job_id: JobId,
    status: JobStatus,
    timeout: Duration,
) -> Job {
    eventually(timeout, || async move {
        store
            .get_job(job_id)
            .await
            .ok()
            .filter(|job| job.status == status)
    })
    .await
}

/// Wait until the job reaches any terminal status.
pub async fn wait_for_terminal(store: &dyn JobStore, job_id: JobId, timeout: Duration) -> Job {
    eventually(timeout, || async move {
        store
            .get_job(job_id)
            .await
            .ok()
            .filter(|job| job.status.is_terminal())
    })
    .await
}
