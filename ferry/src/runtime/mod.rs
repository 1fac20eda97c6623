/// Builder wiring a dispatcher from configuration and dependencies.
pub mod builder;
/// Job intake, per-pool admission and orchestrator task management.
pub mod dispatcher;
/// Durable per-job state machine replayed from the store.
pub mod orchestrator;
/// Supervision of a single attempt on an execution unit.
pub mod supervisor;

pub use builder::DispatcherBuilder;
pub use dispatcher::Dispatcher;
pub use orchestrator::JobOrchestrator;
pub use supervisor::{AttemptSupervisor, SupervisorConfig};
