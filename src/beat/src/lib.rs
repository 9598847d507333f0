//! Periodic scheduler: persisted run history, due-entry detection, and
//! the tick loop that republishes due tasks over the broker.

pub mod beat;
pub mod persistence;
pub mod schedule;

pub use beat::{Beat, SchedulingError};
pub use persistence::{PersistenceError, SchedulePersistence};
pub use schedule::ScheduleEntry;
