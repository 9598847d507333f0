//! ETA scheduling, rate limiting, and the worker pool itself.

pub mod eta;
pub mod pool;
pub mod rate_limit;

pub use eta::EtaScheduler;
pub use pool::{Completion, SlotState, TaskOutcome, WorkerPool};
pub use rate_limit::RateLimiter;
