//! Ready queue, listener, and mediator: the path from broker delivery to
//! pool submission and back.

pub mod listener;
pub mod mediator;
pub mod ready_queue;

pub use listener::Listener;
pub use mediator::Mediator;
pub use ready_queue::{ready_queue, ReadyItem};
