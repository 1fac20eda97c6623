use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};
use uuid::Uuid;

/// Store-assigned, monotonically increasing job identifier.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct JobId(pub i64);

impl Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned attempt identifier, unique across all jobs.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct AttemptId(pub i64);

impl Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to the source/destination pairing a job operates on.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The pipeline operation a job runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Sync,
    Reset,
    Check,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Sync => "sync",
            OperationKind::Reset => "reset",
            OperationKind::Check => "check",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sync" => Some(OperationKind::Sync),
            "reset" => Some(OperationKind::Reset),
            "check" => Some(OperationKind::Check),
            _ => None,
        }
    }
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a job.
///
/// `Pending` and `Running` are the only non-terminal states. A job moves
/// back from `Running` to `Pending` only when it loses its admission slot
/// during restart recovery.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// An invariant violation halted the job; it needs operator attention
    /// and is never resumed automatically.
    Incomplete,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Whether a job currently in `self` may be moved to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Pending, Running) | (Running, Running) | (Running, Pending) => true,
            (Pending | Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Incomplete => "INCOMPLETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(JobStatus::Pending),
            "RUNNING" => Some(JobStatus::Running),
            "SUCCEEDED" => Some(JobStatus::Succeeded),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELLED" => Some(JobStatus::Cancelled),
            "INCOMPLETE" => Some(JobStatus::Incomplete),
            _ => None,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Running => "RUNNING",
            AttemptStatus::Succeeded => "SUCCEEDED",
            AttemptStatus::Failed => "FAILED",
            AttemptStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RUNNING" => Some(AttemptStatus::Running),
            "SUCCEEDED" => Some(AttemptStatus::Succeeded),
            "FAILED" => Some(AttemptStatus::Failed),
            "CANCELLED" => Some(AttemptStatus::Cancelled),
            _ => None,
        }
    }
}

impl Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU and memory ceilings for an execution unit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Fractional CPUs, e.g. `0.5`.
    pub cpus: Option<f64>,
    pub memory_bytes: Option<u64>,
}

/// Immutable snapshot of everything needed to launch the job's units.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Container image, or executable path for local execution.
    pub image: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Connector configuration handed to the unit as `config.json`.
    #[serde(default)]
    pub connector_config: serde_json::Value,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: ResourceLimits,
}

impl JobConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_connector_config(mut self, config: serde_json::Value) -> Self {
        self.connector_config = config;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }
}

/// Request to create a job record.
#[derive(Clone, Debug)]
pub struct NewJob {
    pub connection_id: ConnectionId,
    pub operation: OperationKind,
    pub pool: String,
    pub config: JobConfig,
}

/// One logical request to run an operation for a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub connection_id: ConnectionId,
    pub operation: OperationKind,
    pub status: JobStatus,
    /// Resource pool the job is admitted against.
    pub pool: String,
    pub config: JobConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
}

/// Opaque "where the sync left off" marker emitted by a connector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(pub serde_json::Value);

impl Checkpoint {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// A checkpoint as it was persisted, with its position in the job's history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub job_id: JobId,
    pub attempt_id: AttemptId,
    /// 1-based, dense within the job.
    pub sequence: u64,
    pub checkpoint: Checkpoint,
    pub created_at: DateTime<Utc>,
}

/// Why a failed attempt failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NonZeroExit,
    ErrorTrace,
    TimedOut,
    HeartbeatLapsed,
    StartFailed,
    StreamFailed,
    /// The orchestrator died while the attempt was running.
    Abandoned,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NonZeroExit => "non_zero_exit",
            FailureKind::ErrorTrace => "error_trace",
            FailureKind::TimedOut => "timed_out",
            FailureKind::HeartbeatLapsed => "heartbeat_lapsed",
            FailureKind::StartFailed => "start_failed",
            FailureKind::StreamFailed => "stream_failed",
            FailureKind::Abandoned => "abandoned",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of what an attempt produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptOutput {
    pub records_emitted: u64,
    pub checkpoints_persisted: u64,
    pub parse_errors: u64,
    pub exit_code: Option<i32>,
    pub failure_kind: Option<FailureKind>,
    pub message: Option<String>,
    /// Last CONNECTION_STATUS report, if any.
    pub connection_status: Option<String>,
}

/// Terminal result of one attempt, as recorded in the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttemptOutcome {
    pub status: AttemptStatus,
    pub output: AttemptOutput,
}

impl AttemptOutcome {
    pub fn succeeded(output: AttemptOutput) -> Self {
        Self {
            status: AttemptStatus::Succeeded,
            output,
        }
    }

    pub fn failed(
        mut output: AttemptOutput,
        kind: FailureKind,
        message: impl Into<String>,
    ) -> Self {
        output.failure_kind = Some(kind);
        output.message = Some(message.into());
        Self {
            status: AttemptStatus::Failed,
            output,
        }
    }

    pub fn cancelled(mut output: AttemptOutput) -> Self {
        output
            .message
            .get_or_insert_with(|| "cancellation requested".to_string());
        Self {
            status: AttemptStatus::Cancelled,
            output,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.output.failure_kind,
            Some(FailureKind::TimedOut | FailureKind::HeartbeatLapsed)
        )
    }
}

/// One execution try of a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub id: AttemptId,
    pub job_id: JobId,
    /// 0-based and dense within the job.
    pub number: u32,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Execution unit backing the attempt, set before the unit starts.
    pub unit_id: Option<String>,
    /// Last checkpoint persisted while this attempt ran.
    pub checkpoint: Option<Checkpoint>,
    pub output: AttemptOutput,
}

/// One entry in a job's status history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatusChange {
    pub job_id: JobId,
    pub status: JobStatus,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}
