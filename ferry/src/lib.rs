//! Ferry - durable orchestration of connector sync jobs.
//!
//! Ferry runs data-movement jobs (sync, reset, check) for connections by
//! launching short-lived execution units, reading the line-delimited JSON
//! protocol those units print, persisting their checkpoints as they arrive,
//! and retrying failed attempts from the last checkpoint.
//!
//! # Core Concepts
//!
//! - **Job**: one request to run an operation for a connection. At most one
//!   job per connection is active at a time. See [`Job`] and [`JobStatus`].
//!
//! - **Attempt**: one execution try of a job, numbered densely from 0. See
//!   [`Attempt`] and [`AttemptOutcome`].
//!
//! - **Store**: the [`JobStore`] trait is the only shared durable state.
//!   [`InMemoryJobStore`] ships always; a PostgreSQL store ships with the
//!   `postgres` feature.
//!
//! - **Substrate**: the [`ExecutionSubstrate`] trait starts, watches and
//!   destroys units, either as local processes or as containers.
//!
//! - **Runtime**: the [`Dispatcher`] admits jobs against per-pool limits and
//!   runs one [`JobOrchestrator`] task per admitted job, which drives an
//!   [`AttemptSupervisor`] per attempt.
//!
//! - **Events**: the [`EventBus`] broadcasts lifecycle and connector log
//!   events to any number of subscribers.
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL persistence support via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ferry::*;
//!
//! let dispatcher = DispatcherBuilder::new(FerryConfig::default())
//!     .with_memory_store()
//!     .build()?;
//!
//! let job_id = dispatcher
//!     .submit(
//!         ConnectionId::new(),
//!         OperationKind::Sync,
//!         JobConfig::new("/usr/local/bin/source-faker").with_args(["read"]),
//!     )
//!     .await?;
//!
//! let mut events = dispatcher.subscribe();
//! while let Ok(event) = events.recv().await {
//!     if let JobEventPayload::JobFinished { status, .. } = event.payload {
//!         println!("{job_id} finished: {status}");
//!         break;
//!     }
//! }
//! ```

/// Per-pool concurrency limits and FIFO admission.
pub mod admission;

/// Cooperative cancellation tokens.
pub mod cancel;

/// Engine configuration loaded from TOML.
pub mod config;

/// Error types shared across the engine.
pub mod error;

/// Job lifecycle events and the in-process event bus.
pub mod events;

/// Jobs, attempts, checkpoints and their statuses.
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus collectors for job orchestration.
pub mod metrics;

/// Store implementations: in-memory, and PostgreSQL with the `postgres`
/// feature.
pub mod persistence;

/// Connector output protocol reader.
pub mod protocol;

/// Attempt retry policy and transient-error retries for store writes.
pub mod retry;

/// Dispatcher, orchestrator and attempt supervisor.
pub mod runtime;

/// The durable job store contract.
pub mod store;

/// Execution substrates running connector units.
pub mod substrate;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

pub use admission::*;
pub use cancel::*;
pub use config::*;
pub use error::*;
pub use events::*;
pub use job::*;
pub use persistence::*;
pub use protocol::{parse_line, EventSink, LogLevel, ProtocolEvent, ProtocolReader, TraceEvent};
pub use retry::*;
pub use runtime::*;
pub use store::JobStore;
pub use substrate::{
    ContainerSubstrate, ExecutionSubstrate, LocalProcessSubstrate, UnitExit, UnitHandle,
    UnitOutput, UnitSpec,
};
