//! Monitoring event types and the fire-and-forget dispatcher that
//! publishes them over the broker.

pub mod dispatcher;
pub mod event;

pub use dispatcher::EventDispatcher;
pub use event::{Event, EventRecord};
