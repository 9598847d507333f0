//! ETA scheduling: a min-heap of deferred task messages ordered by
//! eligibility time, with FIFO tie-break among messages due at the same
//! instant.

use foreman_registry::TaskMessage;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, SystemTime};

/// A task message waiting for its ETA to elapse.
#[derive(Debug, Clone)]
struct ScheduledEntry {
    eta: SystemTime,
    sequence: u64,
    message: TaskMessage,
}

/// Earlier ETA sorts first; `BinaryHeap` is a max-heap, so ordering is
/// reversed. Ties break on insertion order (lower sequence first).
impl Ord for ScheduledEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .eta
            .cmp(&self.eta)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for ScheduledEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ScheduledEntry {
    fn eq(&self, other: &Self) -> bool {
        self.eta == other.eta && self.sequence == other.sequence
    }
}

impl Eq for ScheduledEntry {}

/// Holds task messages whose ETA has not yet elapsed. The Mediator polls
/// `pop_due` on a tick of `eta_scheduler_precision` and re-enters anything
/// that's ready.
pub struct EtaScheduler {
    heap: Mutex<BinaryHeap<ScheduledEntry>>,
    next_sequence: Mutex<u64>,
}

impl Default for EtaScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl EtaScheduler {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_sequence: Mutex::new(0),
        }
    }

    /// Enter a message for later delivery at `eta`.
    pub fn enter(&self, message: TaskMessage, eta: SystemTime) {
        let mut seq = self.next_sequence.lock();
        let sequence = *seq;
        *seq += 1;
        drop(seq);

        self.heap.lock().push(ScheduledEntry {
            eta,
            sequence,
            message,
        });
    }

    /// Cancel every scheduled entry for `task_id`. Used when a task is
    /// revoked while still waiting on its ETA.
    pub fn cancel(&self, task_id: foreman_registry::TaskId) -> usize {
        let mut heap = self.heap.lock();
        let remaining: Vec<_> = heap
            .drain()
            .filter(|entry| entry.message.id != task_id)
            .collect();
        let removed = heap.len();
        heap.extend(remaining);
        removed.saturating_sub(heap.len())
    }

    /// Drain every entry whose ETA has elapsed by `now`, in eligibility
    /// order.
    pub fn pop_due(&self, now: SystemTime) -> Vec<TaskMessage> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while let Some(top) = heap.peek() {
            if top.eta > now {
                break;
            }
            due.push(heap.pop().unwrap().message);
        }
        due
    }

    /// Time until the next entry becomes due, or `None` if the heap is
    /// empty. The Mediator uses this to avoid busy-polling when idle.
    pub fn time_until_next(&self, now: SystemTime) -> Option<Duration> {
        self.heap
            .lock()
            .peek()
            .map(|top| top.eta.duration_since(now).unwrap_or(Duration::ZERO))
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn msg(name: &str) -> TaskMessage {
        TaskMessage::new(name)
    }

    #[test]
    fn pops_in_eta_order() {
        let scheduler = EtaScheduler::new();
        let now = SystemTime::now();
        scheduler.enter(msg("c"), now + Duration::from_secs(3));
        scheduler.enter(msg("a"), now + Duration::from_secs(1));
        scheduler.enter(msg("b"), now + Duration::from_secs(2));

        let due = scheduler.pop_due(now + Duration::from_secs(10));
        let names: Vec<_> = due.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn ties_break_fifo() {
        let scheduler = EtaScheduler::new();
        let eta = SystemTime::now();
        scheduler.enter(msg("first"), eta);
        scheduler.enter(msg("second"), eta);

        let due = scheduler.pop_due(eta);
        assert_eq!(due[0].name, "first");
        assert_eq!(due[1].name, "second");
    }

    #[test]
    fn not_yet_due_entries_stay_queued() {
        let scheduler = EtaScheduler::new();
        let now = SystemTime::now();
        scheduler.enter(msg("later"), now + Duration::from_secs(60));

        assert!(scheduler.pop_due(now).is_empty());
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn cancel_removes_matching_entries() {
        let scheduler = EtaScheduler::new();
        let now = SystemTime::now();
        let task = msg("cancel-me");
        let id = task.id;
        scheduler.enter(task, now + Duration::from_secs(5));
        scheduler.enter(msg("keep"), now + Duration::from_secs(5));

        let removed = scheduler.cancel(id);
        assert_eq!(removed, 1);
        assert_eq!(scheduler.len(), 1);
    }

    proptest::proptest! {
        #[test]
        fn pop_due_returns_nondecreasing_etas(offsets in proptest::collection::vec(0u64..10_000, 1..200)) {
            let scheduler = EtaScheduler::new();
            let base = SystemTime::now();
            for offset in &offsets {
                scheduler.enter(msg(&offset.to_string()), base + Duration::from_millis(*offset));
            }

            let due = scheduler.pop_due(base + Duration::from_secs(3600));
            prop_assert_eq!(due.len(), offsets.len());

            let popped: Vec<u64> = due.iter().map(|m| m.name.parse().unwrap()).collect();
            let mut sorted = popped.clone();
            sorted.sort_unstable();
            prop_assert_eq!(popped, sorted);
        }
    }
}
