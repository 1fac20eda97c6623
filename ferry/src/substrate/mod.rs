//! Execution substrates: where connector units actually run.
//!
//! [`ExecutionSubstrate`] is the single capability set the supervisor relies
//! on. [`LocalProcessSubstrate`] runs units as child processes of the
//! orchestrator; [`ContainerSubstrate`] runs them as containers through a
//! Docker-compatible CLI.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::config::{SubstrateConfig, SubstrateKind};
use crate::error::SubstrateError;
use crate::job::{Attempt, Checkpoint, Job, JobId, OperationKind, ResourceLimits};

pub mod container;
pub mod process;

pub use container::ContainerSubstrate;
pub use process::LocalProcessSubstrate;

/// Environment variables every unit receives.
pub const ENV_JOB_ID: &str = "FERRY_JOB_ID";
pub const ENV_ATTEMPT_NUMBER: &str = "FERRY_ATTEMPT_NUMBER";
pub const ENV_UNIT_ID: &str = "FERRY_UNIT_ID";
pub const ENV_OPERATION: &str = "FERRY_OPERATION";
pub const ENV_CONFIG_PATH: &str = "FERRY_CONFIG_PATH";
pub const ENV_STATE_PATH: &str = "FERRY_STATE_PATH";

/// Everything needed to launch one execution unit.
#[derive(Clone, Debug, PartialEq)]
pub struct UnitSpec {
    pub unit_id: String,
    pub job_id: JobId,
    pub attempt_number: u32,
    pub operation: OperationKind,
    pub image: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceLimits,
    /// Connector configuration, materialized as `config.json`.
    pub config: serde_json::Value,
    /// Checkpoint to resume from, materialized as `state.json`.
    pub checkpoint: Option<Checkpoint>,
}

impl UnitSpec {
    /// Build the launch spec for an attempt of `job`.
    pub fn for_attempt(job: &Job, attempt: &Attempt, checkpoint: Option<Checkpoint>) -> Self {
        let unit_id = unit_id_for(job.id, attempt.number);
        let mut env = job.config.env.clone();
        env.insert(ENV_JOB_ID.into(), job.id.to_string());
        env.insert(ENV_ATTEMPT_NUMBER.into(), attempt.number.to_string());
        env.insert(ENV_UNIT_ID.into(), unit_id.clone());
        env.insert(ENV_OPERATION.into(), job.operation.to_string());

        Self {
            unit_id,
            job_id: job.id,
            attempt_number: attempt.number,
            operation: job.operation,
            image: job.config.image.clone(),
            args: job.config.args.clone(),
            env,
            resources: job.config.resources.clone(),
            config: job.config.connector_config.clone(),
            checkpoint,
        }
    }
}

/// Deterministic unit name, so residual units can be found after a crash.
pub fn unit_id_for(job_id: JobId, attempt_number: u32) -> String {
    format!("ferry-job-{}-attempt-{}", job_id.0, attempt_number)
}

/// Reference to a started (or possibly residual) unit.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UnitHandle {
    pub unit_id: String,
}

impl UnitHandle {
    pub fn new(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
        }
    }
}

impl fmt::Display for UnitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.unit_id)
    }
}

/// How waiting for a unit to exit ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitExit {
    /// The unit exited. `code` is `None` when it was killed by a signal.
    Exited { code: Option<i32> },
    TimedOut,
}

/// The unit's protocol byte stream.
pub type UnitOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Creates, watches and tears down execution units.
#[async_trait]
pub trait ExecutionSubstrate: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self, spec: &UnitSpec) -> Result<UnitHandle, SubstrateError>;

    /// Take the unit's output stream. Can be taken once per unit.
    async fn attach_output(&self, handle: &UnitHandle) -> Result<UnitOutput, SubstrateError>;

    /// Ask the unit to stop gracefully.
    async fn signal_terminate(&self, handle: &UnitHandle) -> Result<(), SubstrateError>;

    async fn await_exit(
        &self,
        handle: &UnitHandle,
        timeout: Duration,
    ) -> Result<UnitExit, SubstrateError>;

    /// Kill the unit if alive and free everything it holds.
    ///
    /// Idempotent. Works for units this instance never started, so residual
    /// units from a crashed orchestrator can be cleaned up by id.
    async fn destroy(&self, handle: &UnitHandle) -> Result<(), SubstrateError>;
}

/// Build the substrate selected in configuration.
pub fn from_config(config: &SubstrateConfig) -> Arc<dyn ExecutionSubstrate> {
    match config.kind {
        SubstrateKind::Local => Arc::new(LocalProcessSubstrate::new(config.clone())),
        SubstrateKind::Container => Arc::new(ContainerSubstrate::new(config.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AttemptOutput, AttemptStatus, AttemptId, ConnectionId, JobConfig, JobStatus};
    use chrono::Utc;
    use serde_json::json;

    fn job() -> Job {
        Job {
            id: JobId(12),
            connection_id: ConnectionId::new(),
            operation: OperationKind::Sync,
            status: JobStatus::Running,
            pool: "sync".into(),
            config: JobConfig::new("airbyte/source-postgres:1.0")
                .with_args(["read"])
                .with_env("LOG_LEVEL", "debug")
                .with_connector_config(json!({"host": "db"})),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            failure_reason: None,
        }
    }

    fn attempt(number: u32) -> Attempt {
        Attempt {
            id: AttemptId(1),
            job_id: JobId(12),
            number,
            status: AttemptStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            unit_id: None,
            checkpoint: None,
            output: AttemptOutput::default(),
        }
    }

    #[test]
    fn spec_carries_identity_env_and_checkpoint() {
        let checkpoint = Checkpoint::new(json!({"cursor": 100}));
        let spec = UnitSpec::for_attempt(&job(), &attempt(2), Some(checkpoint.clone()));

        assert_eq!(spec.unit_id, "ferry-job-12-attempt-2");
        assert_eq!(spec.env[ENV_JOB_ID], "12");
        assert_eq!(spec.env[ENV_ATTEMPT_NUMBER], "2");
        assert_eq!(spec.env[ENV_OPERATION], "sync");
        assert_eq!(spec.env["LOG_LEVEL"], "debug");
        assert_eq!(spec.checkpoint, Some(checkpoint));
        assert_eq!(spec.config, json!({"host": "db"}));
    }
}
