use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{AttemptId, AttemptStatus, ConnectionId, FailureKind, JobId, JobStatus, OperationKind};
use crate::protocol::LogLevel;

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(job_id: JobId) -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            job_id,
            timestamp: Utc::now(),
        }
    }
}

/// Job lifecycle or log event with metadata.
#[derive(Clone, Debug)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(job_id: JobId, payload: JobEventPayload) -> Self {
        Self {
            meta: EventMeta::new(job_id),
            payload,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.meta.job_id
    }
}

/// What happened.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum JobEventPayload {
    Submitted {
        connection_id: ConnectionId,
        operation: OperationKind,
        pool: String,
    },
    /// Waiting for a slot in its pool.
    Queued { pool: String, position: usize },
    Admitted { pool: String },
    StatusChanged { status: JobStatus },
    AttemptStarted {
        attempt_id: AttemptId,
        attempt_number: u32,
        unit_id: String,
    },
    CheckpointPersisted { attempt_number: u32, sequence: u64 },
    /// A LOG line emitted by the connector.
    AttemptLog {
        attempt_number: u32,
        level: LogLevel,
        message: String,
    },
    AttemptFinished {
        attempt_number: u32,
        status: AttemptStatus,
        failure_kind: Option<FailureKind>,
    },
    RetryScheduled { next_attempt: u32, delay_ms: u64 },
    JobFinished {
        status: JobStatus,
        reason: Option<String>,
    },
}

/// In-process fan-out of [`JobEvent`]s over a tokio broadcast channel.
///
/// Publishing never waits for subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged` and skips ahead.
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish to all current subscribers; dropped if there are none.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn emit(&self, job_id: JobId, payload: JobEventPayload) {
        self.publish(JobEvent::new(job_id, payload));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
