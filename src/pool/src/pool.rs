//! Worker pool: bounded-concurrency execution slots with soft/hard time
//! limits, `max_tasks_per_child` recycling, and cooperative revocation.
//!
//! Each slot is a plain `tokio::task` rather than an isolated process:
//! true process-level isolation is out of scope for this core, so a
//! hard-time-limited async task stands in for a forked worker.

use foreman_registry::{ForemanError, RegistryEntry, TaskId, TaskMessage};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

/// Lifecycle state of one execution slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy,
    Recycling,
}

/// Terminal outcome of one task execution, reported to the Mediator.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success(serde_json::Value),
    Failure(String),
    Retry(Option<Duration>),
    Revoked,
    SoftTimeLimitExceeded,
    HardTimeLimitExceeded,
    WorkerLost,
}

/// One completed execution, paired with the task it belongs to. Carries
/// the original message (not just its id) so a handler-initiated retry
/// can be rebuilt without a second registry round trip.
#[derive(Debug, Clone)]
pub struct Completion {
    pub task: TaskMessage,
    pub outcome: TaskOutcome,
    pub runtime: Duration,
}

struct SlotTracker {
    states: Vec<Mutex<SlotState>>,
    completions: Vec<AtomicU64>,
}

/// A bounded pool of execution slots. `submit` never blocks the caller
/// past acquiring a permit; completions are reported asynchronously on
/// `completions()`.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    tracker: Arc<SlotTracker>,
    max_tasks_per_child: Option<u64>,
    revoked: Arc<RwLock<HashSet<TaskId>>>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: Mutex<Option<mpsc::UnboundedReceiver<Completion>>>,
}

impl WorkerPool {
    pub fn new(concurrency: usize, max_tasks_per_child: Option<u64>) -> Self {
        let concurrency = concurrency.max(1);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            tracker: Arc::new(SlotTracker {
                states: (0..concurrency).map(|_| Mutex::new(SlotState::Idle)).collect(),
                completions: (0..concurrency).map(|_| AtomicU64::new(0)).collect(),
            }),
            max_tasks_per_child,
            revoked: Arc::new(RwLock::new(HashSet::new())),
            completion_tx,
            completion_rx: Mutex::new(Some(completion_rx)),
        }
    }

    /// Take ownership of the completion stream. Panics if called twice;
    /// there is exactly one Mediator per pool.
    pub fn completions(&self) -> mpsc::UnboundedReceiver<Completion> {
        self.completion_rx
            .lock()
            .take()
            .expect("completions() already taken")
    }

    pub fn revoke(&self, task_id: TaskId) {
        self.revoked.write().insert(task_id);
    }

    pub fn is_revoked(&self, task_id: &TaskId) -> bool {
        self.revoked.read().contains(task_id)
    }

    pub fn slot_states(&self) -> Vec<SlotState> {
        self.tracker.states.iter().map(|s| *s.lock()).collect()
    }

    /// Number of slots not currently `Idle`, for warm-shutdown draining
    /// and telemetry.
    pub fn active_slots(&self) -> usize {
        self.tracker.states.iter().filter(|s| *s.lock() != SlotState::Idle).count()
    }

    /// Submit a task for execution once a slot is free. Returns
    /// immediately; the result arrives on the completion channel.
    pub fn submit(&self, task: TaskMessage, entry: RegistryEntry) -> Result<(), ForemanError> {
        if self.is_revoked(&task.id) {
            let _ = self.completion_tx.send(Completion {
                task,
                outcome: TaskOutcome::Revoked,
                runtime: Duration::ZERO,
            });
            return Ok(());
        }

        let semaphore = self.semaphore.clone();
        let tracker = self.tracker.clone();
        let revoked = self.revoked.clone();
        let completion_tx = self.completion_tx.clone();
        let max_tasks_per_child = self.max_tasks_per_child;

        tokio::spawn(async move {
            let permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let slot_index = Self::claim_slot(&tracker);

            if revoked.read().contains(&task.id) {
                Self::release_slot(&tracker, slot_index, max_tasks_per_child);
                let _ = completion_tx.send(Completion {
                    task,
                    outcome: TaskOutcome::Revoked,
                    runtime: Duration::ZERO,
                });
                drop(permit);
                return;
            }

            info!(task_id = %task.id, task_name = %task.name, slot = slot_index, "executing task");
            let started = Instant::now();
            let outcome = Self::run_handler(&entry, task.args.clone(), task.kwargs.clone()).await;
            let runtime = started.elapsed();

            Self::release_slot(&tracker, slot_index, max_tasks_per_child);
            let _ = completion_tx.send(Completion { task, outcome, runtime });
            drop(permit);
        });

        Ok(())
    }

    fn claim_slot(tracker: &SlotTracker) -> usize {
        for (i, state) in tracker.states.iter().enumerate() {
            let mut state = state.lock();
            if *state == SlotState::Idle {
                *state = SlotState::Busy;
                return i;
            }
        }
        // Every tracked slot was already busy (submit outran the
        // semaphore's bookkeeping under heavy concurrency); fall back to
        // slot 0's counters for metrics purposes only.
        0
    }

    /// Mark a slot free after a completion. When `max_tasks_per_child` is
    /// reached the slot visibly passes through `Recycling` (observable via
    /// `slot_states`) before becoming idle again; there is no real child
    /// process to respawn here, so the transition is instantaneous rather
    /// than modeling a respawn delay.
    fn release_slot(tracker: &Arc<SlotTracker>, slot_index: usize, max_tasks_per_child: Option<u64>) {
        let completed = tracker.completions[slot_index].fetch_add(1, Ordering::Relaxed) + 1;
        if matches!(max_tasks_per_child, Some(max) if completed >= max) {
            tracker.completions[slot_index].store(0, Ordering::Relaxed);
            warn!(slot = slot_index, completed, "recycling slot after max_tasks_per_child");
            *tracker.states[slot_index].lock() = SlotState::Recycling;
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                *tracker.states[slot_index].lock() = SlotState::Idle;
            });
        } else {
            *tracker.states[slot_index].lock() = SlotState::Idle;
        }
    }

    async fn run_handler(
        entry: &RegistryEntry,
        args: Vec<serde_json::Value>,
        kwargs: std::collections::HashMap<String, serde_json::Value>,
    ) -> TaskOutcome {
        let handler = entry.handler.clone();
        let join = tokio::spawn(async move { handler(args, kwargs).await });

        let soft_limit = entry.soft_time_limit;
        let hard_limit = entry.hard_time_limit;
        let mut soft_fired = false;

        let outcome = match hard_limit {
            None => match Self::await_with_soft_warning(join, soft_limit, &mut soft_fired).await {
                Ok(outcome) => outcome,
                Err(_) => TaskOutcome::WorkerLost,
            },
            Some(hard) => {
                match tokio::time::timeout(
                    hard,
                    Self::await_with_soft_warning(join, soft_limit, &mut soft_fired),
                )
                .await
                {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => TaskOutcome::WorkerLost,
                    Err(_) => TaskOutcome::HardTimeLimitExceeded,
                }
            }
        };

        if soft_fired {
            if let TaskOutcome::Success(_) = outcome {
                return TaskOutcome::SoftTimeLimitExceeded;
            }
        }
        outcome
    }

    async fn await_with_soft_warning(
        join: tokio::task::JoinHandle<foreman_registry::HandlerOutcome>,
        soft_limit: Option<Duration>,
        soft_fired: &mut bool,
    ) -> Result<TaskOutcome, tokio::task::JoinError> {
        let mut join = join;
        match soft_limit {
            None => join.await.map(Self::map_handler_outcome),
            Some(soft) => {
                tokio::select! {
                    result = &mut join => result.map(Self::map_handler_outcome),
                    _ = tokio::time::sleep(soft) => {
                        *soft_fired = true;
                        warn!("soft time limit exceeded, continuing until hard limit");
                        join.await.map(Self::map_handler_outcome)
                    }
                }
            }
        }
    }

    fn map_handler_outcome(outcome: foreman_registry::HandlerOutcome) -> TaskOutcome {
        match outcome {
            foreman_registry::HandlerOutcome::Success(v) => TaskOutcome::Success(v),
            foreman_registry::HandlerOutcome::Failure(e) => TaskOutcome::Failure(e),
            foreman_registry::HandlerOutcome::Retry(delay) => TaskOutcome::Retry(delay),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_registry::HandlerOutcome;
    use futures::FutureExt;
    use std::sync::Arc as StdArc;

    fn entry_with_handler(
        name: &str,
        handler: foreman_registry::Handler,
    ) -> RegistryEntry {
        RegistryEntry::new(name, handler)
    }

    #[tokio::test]
    async fn successful_task_reports_success() {
        let pool = WorkerPool::new(2, None);
        let mut completions = pool.completions();
        let handler: foreman_registry::Handler =
            StdArc::new(|_a, _k| async { HandlerOutcome::Success(serde_json::json!("ok")) }.boxed());
        let task = TaskMessage::new("greet");
        pool.submit(task.clone(), entry_with_handler("greet", handler)).unwrap();

        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.task.id, task.id);
        assert!(matches!(completion.outcome, TaskOutcome::Success(_)));
    }

    #[tokio::test]
    async fn revoked_task_is_skipped() {
        let pool = WorkerPool::new(1, None);
        let mut completions = pool.completions();
        let task = TaskMessage::new("skip-me");
        pool.revoke(task.id);

        let handler: foreman_registry::Handler =
            StdArc::new(|_a, _k| async { HandlerOutcome::Success(serde_json::Value::Null) }.boxed());
        pool.submit(task.clone(), entry_with_handler("skip-me", handler)).unwrap();

        let completion = completions.recv().await.unwrap();
        assert!(matches!(completion.outcome, TaskOutcome::Revoked));
    }

    #[tokio::test]
    async fn hard_limit_terminates_slow_handler() {
        let pool = WorkerPool::new(1, None);
        let mut completions = pool.completions();
        let handler: foreman_registry::Handler = StdArc::new(|_a, _k| {
            async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                HandlerOutcome::Success(serde_json::Value::Null)
            }
            .boxed()
        });
        let mut entry = entry_with_handler("slow", handler);
        entry.hard_time_limit = Some(Duration::from_millis(50));

        let task = TaskMessage::new("slow");
        pool.submit(task, entry).unwrap();

        let completion = completions.recv().await.unwrap();
        assert!(matches!(completion.outcome, TaskOutcome::HardTimeLimitExceeded));
    }
}
