use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Why a token was cancelled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// Someone asked for the job to be cancelled. Terminal for the job.
    Requested,
    /// The dispatcher is stopping. The job stays resumable.
    Shutdown,
}

const NOT_CANCELLED: u8 = 0;
const REQUESTED: u8 = 1;
const SHUTDOWN: u8 = 2;

/// Cooperative cancellation signal shared between a job's owner and the
/// tasks working on it. The first reason wins.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    state: AtomicU8,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Returns `false` if the token was already cancelled.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let value = match reason {
            CancelReason::Requested => REQUESTED,
            CancelReason::Shutdown => SHUTDOWN,
        };
        let won = self
            .inner
            .state
            .compare_exchange(NOT_CANCELLED, value, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        self.inner.notify.notify_waiters();
        won
    }

    pub fn reason(&self) -> Option<CancelReason> {
        match self.inner.state.load(Ordering::SeqCst) {
            REQUESTED => Some(CancelReason::Requested),
            SHUTDOWN => Some(CancelReason::Shutdown),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            // Register before checking so a concurrent cancel is not missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(reason) = self.reason() {
                return reason;
            }
            notified.await;
        }
    }
}
