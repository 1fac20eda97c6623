use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::job::OperationKind;

/// How the delay between retries grows.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always wait `delay_ms`.
    Fixed { delay_ms: u64 },
    /// `base_ms + step_ms * (n - 1)`, capped at `max_ms`.
    Linear {
        base_ms: u64,
        step_ms: u64,
        max_ms: u64,
    },
    /// `base_ms * 2^(n - 1)`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base_ms: 1_000,
            max_ms: 300_000,
        }
    }
}

impl BackoffStrategy {
    /// Delay before retry number `retry` (1-based). Retry 0 has no delay.
    pub fn delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let n = u64::from(retry - 1);
        let ms = match *self {
            BackoffStrategy::Fixed { delay_ms } => delay_ms,
            BackoffStrategy::Linear {
                base_ms,
                step_ms,
                max_ms,
            } => base_ms.saturating_add(step_ms.saturating_mul(n)).min(max_ms),
            BackoffStrategy::Exponential { base_ms, max_ms } => {
                let scaled = (base_ms as f64) * 2f64.powi(n.min(62) as i32);
                scaled.min(max_ms as f64).max(0.0) as u64
            }
        };
        Duration::from_millis(ms)
    }
}

/// Attempt budget per operation kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaxAttempts {
    pub sync: u32,
    pub reset: u32,
    pub check: u32,
}

impl Default for MaxAttempts {
    fn default() -> Self {
        Self {
            sync: 3,
            reset: 3,
            check: 1,
        }
    }
}

impl MaxAttempts {
    pub fn for_operation(&self, operation: OperationKind) -> u32 {
        let max = match operation {
            OperationKind::Sync => self.sync,
            OperationKind::Reset => self.reset,
            OperationKind::Check => self.check,
        };
        max.max(1)
    }
}

/// What to do after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Job-level retry policy applied to failed attempts.
///
/// Transient infrastructure errors are not attempts and never reach this
/// policy; see [`retry_transient`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: MaxAttempts,
    pub backoff: BackoffStrategy,
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, operation: OperationKind, max: u32) -> Self {
        match operation {
            OperationKind::Sync => self.max_attempts.sync = max,
            OperationKind::Reset => self.max_attempts.reset = max,
            OperationKind::Check => self.max_attempts.check = max,
        }
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Decide after `attempts_made` attempts, the last of which failed.
    pub fn decide(&self, operation: OperationKind, attempts_made: u32) -> RetryDecision {
        if attempts_made >= self.max_attempts.for_operation(operation) {
            RetryDecision::GiveUp
        } else {
            RetryDecision::Retry {
                delay: self.backoff.delay(attempts_made),
            }
        }
    }
}

/// Retry settings for store writes hitting transient outages.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreRetryConfig {
    /// Total tries, including the first.
    pub max_tries: u32,
    pub backoff: BackoffStrategy,
}

impl Default for StoreRetryConfig {
    fn default() -> Self {
        Self {
            max_tries: 5,
            backoff: BackoffStrategy::Exponential {
                base_ms: 200,
                max_ms: 5_000,
            },
        }
    }
}

/// Run a store operation, retrying while it fails with a transient error.
pub async fn retry_transient<T, F, Fut>(
    config: &StoreRetryConfig,
    operation: &str,
    mut f: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        match f().await {
            Err(err) if err.is_transient() && tries < config.max_tries.max(1) => {
                let delay = config.backoff.delay(tries);
                warn!(
                    operation,
                    tries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "store unavailable, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            result => return result,
        }
    }
}

/// Run a store write that must not be applied twice, retrying transient errors.
///
/// A transient error does not prove the write was rolled back: the commit may
/// have landed before the connection dropped. Before every retry, `recover`
/// reads back the store and returns the value the write produced, if it did
/// land. That value is returned instead of writing again.
pub async fn retry_write<T, W, WFut, R, RFut>(
    config: &StoreRetryConfig,
    operation: &str,
    mut write: W,
    mut recover: R,
) -> Result<T, StoreError>
where
    W: FnMut() -> WFut,
    WFut: Future<Output = Result<T, StoreError>>,
    R: FnMut() -> RFut,
    RFut: Future<Output = Result<Option<T>, StoreError>>,
{
    let mut replay = false;
    retry_transient(config, operation, || {
        let recovered = std::mem::replace(&mut replay, true).then(&mut recover);
        let attempt = write();
        async move {
            if let Some(recovered) = recovered {
                if let Some(value) = recovered.await? {
                    debug!(operation, "earlier try was applied, not writing again");
                    return Ok(value);
                }
            }
            attempt.await
        }
    })
    .await
}
