//! Broker interface, in-memory implementation, and reconnect policy.
//!
//! The Listener, Beat, and Event Dispatcher all depend on the [`Broker`]
//! trait rather than a concrete transport. [`InMemoryBroker`] is both the
//! test double and the zero-dependency default for local development; a
//! real AMQP/Redis transport can be added later behind the same trait
//! without touching callers.

pub mod broker;
pub mod memory;
pub mod reconnect;

pub use broker::{Broker, Delivery, PublishProperties};
pub use memory::InMemoryBroker;
pub use reconnect::{ReconnectError, ReconnectPolicy};
