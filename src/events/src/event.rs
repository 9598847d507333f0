//! Monitoring event records published on the dedicated event exchange.

use chrono::{DateTime, Utc};
use foreman_registry::TaskId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the eight monitoring record types the worker emits when events
/// are enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    WorkerOnline { worker_id: Uuid, hostname: String },
    WorkerOffline { worker_id: Uuid },
    WorkerHeartbeat { worker_id: Uuid, active_tasks: usize },
    TaskReceived { task_id: TaskId, task_name: String },
    TaskStarted { task_id: TaskId },
    TaskSucceeded { task_id: TaskId, runtime_secs: f64 },
    TaskFailed { task_id: TaskId, reason: String },
    TaskRevoked { task_id: TaskId },
}

/// The envelope actually published: the event plus a timestamp, since the
/// variants above carry no timing of their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl EventRecord {
    pub fn now(event: Event) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}
