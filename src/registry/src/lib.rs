//! Task registry, router, message codec, and the worker error taxonomy.
//!
//! This crate carries no I/O of its own: it is the shared vocabulary the
//! broker, pool, dispatch, events, and beat crates all build on.

pub mod codec;
pub mod error;
pub mod registry;
pub mod router;
pub mod task;

pub use codec::Serializer;
pub use error::{ForemanError, ForemanResult};
pub use registry::{Handler, HandlerOutcome, PeriodicSchedule, Registry, RegistryEntry};
pub use router::{Router, RoutingRule};
pub use task::{
    retry_eta, DeliveryInfo, ExchangeType, QueueDescriptor, TaskCounterSink, TaskId, TaskMessage,
    TaskState,
};
