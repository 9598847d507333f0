//! Core data model: task messages, queue descriptors, and the message
//! state machine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Unique identifier for a task message.
pub type TaskId = Uuid;

/// Exchange kinds a [`QueueDescriptor`] may bind through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeType {
    Direct,
    Topic,
    Fanout,
}

/// A queue/exchange/binding triple, as declared on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    pub exchange: String,
    pub exchange_type: ExchangeType,
    pub binding_key: String,
    pub routing_key: String,
}

impl QueueDescriptor {
    /// The default binding the Router falls back to when
    /// `create_missing_queues` registers a previously-unknown queue: a
    /// direct exchange whose name, binding key, and routing key all equal
    /// the queue name.
    pub fn default_direct(queue: impl Into<String>) -> Self {
        let name = queue.into();
        Self {
            exchange: name.clone(),
            exchange_type: ExchangeType::Direct,
            binding_key: name.clone(),
            routing_key: name.clone(),
            name,
        }
    }
}

/// The lifecycle state of a task message. Transitions are monotonic except
/// that `Scheduled -> Ready` happens exactly once, when the ETA elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Received,
    Scheduled,
    Ready,
    Executing,
    Acked,
    Rejected,
}

impl TaskState {
    /// Whether `self -> next` is a legal transition under the state
    /// machine in the data model (`received -> (scheduled ->)? ready ->
    /// executing -> (acked | rejected)`).
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Received, Scheduled)
                | (Received, Ready)
                | (Received, Rejected)
                | (Scheduled, Ready)
                | (Scheduled, Rejected)
                | (Ready, Executing)
                | (Ready, Rejected)
                | (Executing, Acked)
                | (Executing, Rejected)
        )
    }
}

/// Delivery metadata carried alongside a task message, owned by the
/// Listener until the pool reports completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryInfo {
    pub ack_tag: u64,
    pub redelivered: bool,
    pub queue: String,
}

/// An incoming task message, decoded from the broker payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: TaskId,
    pub name: String,
    pub args: Vec<serde_json::Value>,
    pub kwargs: HashMap<String, serde_json::Value>,
    pub eta: Option<SystemTime>,
    pub expires: Option<SystemTime>,
    pub retries: u32,
    #[serde(skip)]
    pub delivery: Option<DeliveryInfo>,
}

impl TaskMessage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            args: Vec::new(),
            kwargs: HashMap::new(),
            eta: None,
            expires: None,
            retries: 0,
            delivery: None,
        }
    }

    /// An ETA in the past is treated as immediately ready (spec Open
    /// Question, resolved).
    pub fn is_due(&self, now: SystemTime) -> bool {
        match self.eta {
            Some(eta) => eta <= now,
            None => true,
        }
    }

    /// Produce a fresh message for a handler-initiated retry: same id and
    /// payload, incremented retry count, a new ETA computed by the caller.
    pub fn for_retry(&self, eta: SystemTime) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            eta: Some(eta),
            expires: self.expires,
            retries: self.retries + 1,
            delivery: None,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.expires, Some(exp) if exp <= now)
    }
}

/// Sink for per-task-name execution counters, implemented by the worker
/// process's persisted state and called from the Mediator's reconcile
/// loop. Kept as a trait here, rather than a direct dependency on the
/// root crate's state type, since `foreman-registry` sits below
/// `foreman-dispatch` in the workspace and cannot depend back on it.
pub trait TaskCounterSink: Send + Sync {
    fn record_succeeded(&self, task_name: &str);
    fn record_failed(&self, task_name: &str);
    fn record_retried(&self, task_name: &str);
    fn record_revoked(&self, task_name: &str);
}

/// A convenience builder for computing retry backoff, used by both the
/// Pool's `Retry` handling and tests.
pub fn retry_eta(now: SystemTime, attempt: u32, base: Duration, cap: Duration) -> SystemTime {
    let factor = 2u32.saturating_pow(attempt.min(16));
    let delay = base.saturating_mul(factor).min(cap);
    now + delay
}
