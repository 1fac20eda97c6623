use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::job::{ConnectionId, JobConfig, JobId, OperationKind};

/// Concurrency limits per resource pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Limit for pools not listed in `limits`.
    pub default_limit: usize,
    pub limits: HashMap<String, usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_limit: 4,
            limits: HashMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn with_default(default_limit: usize) -> Self {
        Self {
            default_limit,
            limits: HashMap::new(),
        }
    }

    pub fn with_limit(mut self, pool: impl Into<String>, limit: usize) -> Self {
        self.limits.insert(pool.into(), limit);
        self
    }

    pub fn limit(&self, pool: &str) -> usize {
        self.limits.get(pool).copied().unwrap_or(self.default_limit)
    }
}

/// Maps a submitted job to the resource pool it is admitted against.
pub trait PoolResolver: Send + Sync {
    fn pool_for(
        &self,
        connection_id: ConnectionId,
        operation: OperationKind,
        config: &JobConfig,
    ) -> String;
}

/// One pool per operation kind: `sync`, `reset`, `check`.
#[derive(Clone, Copy, Debug, Default)]
pub struct OperationPoolResolver;

impl PoolResolver for OperationPoolResolver {
    fn pool_for(
        &self,
        _connection_id: ConnectionId,
        operation: OperationKind,
        _config: &JobConfig,
    ) -> String {
        operation.as_str().to_string()
    }
}

/// Result of asking for a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Waiting in the pool's FIFO; `position` 0 is next in line.
    Queued { position: usize },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolUtilization {
    pub running: usize,
    pub pending: usize,
    pub limit: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    running: HashSet<JobId>,
    pending: VecDeque<JobId>,
}

/// Per-pool running set and FIFO of jobs waiting for a slot.
///
/// A job is admitted only if the pool has spare capacity and nobody is
/// queued ahead of it. Releasing a slot hands it straight to the head of
/// the queue.
pub struct AdmissionControl {
    config: PoolConfig,
    pools: Mutex<HashMap<String, PoolState>>,
}

impl fmt::Debug for AdmissionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("AdmissionControl");
        debug.field("config", &self.config);
        match self.pools.try_lock() {
            Some(pools) => {
                debug.field("pools", &*pools);
            }
            None => {
                debug.field("pools", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl AdmissionControl {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Take a slot in `pool` for `job_id`, or join the back of its queue.
    pub fn admit(&self, pool: &str, job_id: JobId) -> Admission {
        let limit = self.config.limit(pool);
        let mut pools = self.pools.lock();
        let state = pools.entry(pool.to_string()).or_default();

        if state.running.contains(&job_id) {
            return Admission::Admitted;
        }
        if let Some(position) = state.pending.iter().position(|queued| *queued == job_id) {
            return Admission::Queued { position };
        }
        if state.pending.is_empty() && state.running.len() < limit {
            state.running.insert(job_id);
            Admission::Admitted
        } else {
            state.pending.push_back(job_id);
            Admission::Queued {
                position: state.pending.len() - 1,
            }
        }
    }

    /// Give back the slot held by `job_id`.
    ///
    /// Returns the queued job that now holds the slot, if any.
    pub fn release(&self, pool: &str, job_id: JobId) -> Option<JobId> {
        let limit = self.config.limit(pool);
        let mut pools = self.pools.lock();
        let state = pools.get_mut(pool)?;

        state.running.remove(&job_id);
        if state.running.len() < limit {
            if let Some(next) = state.pending.pop_front() {
                state.running.insert(next);
                return Some(next);
            }
        }
        None
    }

    /// Remove a queued job. Returns `false` if it was not queued.
    pub fn withdraw(&self, pool: &str, job_id: JobId) -> bool {
        let mut pools = self.pools.lock();
        let Some(state) = pools.get_mut(pool) else {
            return false;
        };
        match state.pending.iter().position(|queued| *queued == job_id) {
            Some(index) => {
                state.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Jobs waiting in `pool`, head first.
    pub fn queued(&self, pool: &str) -> Vec<JobId> {
        self.pools
            .lock()
            .get(pool)
            .map(|state| state.pending.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn utilization(&self, pool: &str) -> PoolUtilization {
        let limit = self.config.limit(pool);
        let pools = self.pools.lock();
        match pools.get(pool) {
            Some(state) => PoolUtilization {
                running: state.running.len(),
                pending: state.pending.len(),
                limit,
            },
            None => PoolUtilization {
                limit,
                ..PoolUtilization::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_pool_limit_and_queues_fifo() {
        let admission = AdmissionControl::new(PoolConfig::with_default(2));

        assert_eq!(admission.admit("sync", JobId(1)), Admission::Admitted);
        assert_eq!(admission.admit("sync", JobId(2)), Admission::Admitted);
        assert_eq!(
            admission.admit("sync", JobId(3)),
            Admission::Queued { position: 0 }
        );
        assert_eq!(
            admission.admit("sync", JobId(4)),
            Admission::Queued { position: 1 }
        );

        let util = admission.utilization("sync");
        assert_eq!((util.running, util.pending, util.limit), (2, 2, 2));

        assert_eq!(admission.release("sync", JobId(2)), Some(JobId(3)));
        assert_eq!(admission.release("sync", JobId(1)), Some(JobId(4)));
        assert_eq!(admission.release("sync", JobId(3)), None);
        assert_eq!(admission.utilization("sync").running, 1);
    }

    #[test]
    fn pools_are_independent() {
        let admission =
            AdmissionControl::new(PoolConfig::with_default(1).with_limit("check", 3));

        assert_eq!(admission.admit("sync", JobId(1)), Admission::Admitted);
        assert!(matches!(
            admission.admit("sync", JobId(2)),
            Admission::Queued { .. }
        ));
        for id in 10..13 {
            assert_eq!(admission.admit("check", JobId(id)), Admission::Admitted);
        }
        assert_eq!(admission.utilization("check").running, 3);
    }

    #[test]
    fn queued_jobs_cannot_be_overtaken() {
        let admission = AdmissionControl::new(PoolConfig::with_default(1));
        admission.admit("sync", JobId(1));
        admission.admit("sync", JobId(2));

        // Slot freed but handed to job 2, so job 3 still queues.
        assert_eq!(admission.release("sync", JobId(1)), Some(JobId(2)));
        assert_eq!(
            admission.admit("sync", JobId(3)),
            Admission::Queued { position: 0 }
        );
    }

    #[test]
    fn withdraw_removes_only_queued_jobs() {
        let admission = AdmissionControl::new(PoolConfig::with_default(1));
        admission.admit("sync", JobId(1));
        admission.admit("sync", JobId(2));
        admission.admit("sync", JobId(3));

        assert!(admission.withdraw("sync", JobId(2)));
        assert!(!admission.withdraw("sync", JobId(2)));
        assert!(!admission.withdraw("sync", JobId(1)));
        assert_eq!(admission.queued("sync"), vec![JobId(3)]);
        assert_eq!(admission.release("sync", JobId(1)), Some(JobId(3)));
    }

    #[test]
    fn admit_is_idempotent() {
        let admission = AdmissionControl::new(PoolConfig::with_default(1));
        assert_eq!(admission.admit("sync", JobId(1)), Admission::Admitted);
        assert_eq!(admission.admit("sync", JobId(1)), Admission::Admitted);
        assert_eq!(admission.utilization("sync").running, 1);
    }

    #[test]
    fn release_of_unknown_pool_is_harmless() {
        let admission = AdmissionControl::new(PoolConfig::default());
        assert_eq!(admission.release("nope", JobId(1)), None);
        assert_eq!(admission.utilization("nope").limit, 4);
    }
}
