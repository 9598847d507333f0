//! Foreman: a distributed task-execution worker.
//!
//! Consumes task messages from a broker, schedules future-ETA work,
//! rate-limits admission per task name, and executes work across a
//! bounded pool of slots. A periodic beat scheduler and a fire-and-forget
//! event dispatcher round out the worker's ambient services. See
//! `foreman-registry`, `foreman-broker`, `foreman-pool`,
//! `foreman-dispatch`, `foreman-events`, and `foreman-beat` for the core
//! engine; this crate wires them into a runnable process.

pub mod platform;
pub mod state;

pub use foreman_registry::{
    ForemanError, ForemanResult, Handler, HandlerOutcome, PeriodicSchedule, Registry,
    RegistryEntry, Router, RoutingRule, Serializer, TaskId, TaskMessage,
};
pub use platform::{Platform, PlatformRuntime, ServiceRegistration, WorkerConfig, WorkerContext};
pub use state::WorkerState;
