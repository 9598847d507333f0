//! Bounded FIFO of admitted tasks awaiting a pool slot.

use foreman_registry::{RegistryEntry, TaskMessage};
use tokio::sync::mpsc;

/// One task admitted past decode/routing, carrying the registry entry it
/// resolved to so the Mediator doesn't need a second lookup.
#[derive(Clone)]
pub struct ReadyItem {
    pub message: TaskMessage,
    pub entry: RegistryEntry,
}

/// Construct a bounded ready queue. Capacity should equal the Listener's
/// prefetch window so a full ready queue naturally backpressures
/// consumption.
pub fn ready_queue(capacity: usize) -> (mpsc::Sender<ReadyItem>, mpsc::Receiver<ReadyItem>) {
    mpsc::channel(capacity.max(1))
}
