//! The Beat tick loop: collect due entries, dispatch each as a fresh
//! broker message over the same producer path an external client would
//! use, and checkpoint the schedule.

use crate::persistence::SchedulePersistence;
use crate::schedule::ScheduleEntry;
use chrono::Utc;
use foreman_broker::{Broker, PublishProperties};
use foreman_registry::{ForemanError, Registry, Router, Serializer, TaskMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("failed to publish periodic task {name}: {source}")]
    Publish { name: String, source: ForemanError },
}

/// Owns the persistent schedule and the tick loop. `max_loop_interval`
/// bounds how long the loop ever sleeps, even when every entry reports a
/// distant `next_check`.
pub struct Beat {
    schedule: Mutex<HashMap<String, ScheduleEntry>>,
    persistence: SchedulePersistence,
    registry: Registry,
    router: Arc<Router>,
    broker: Arc<dyn Broker>,
    codec: Serializer,
    max_loop_interval: Duration,
    sync_every: Duration,
}

impl Beat {
    pub fn new(
        persistence: SchedulePersistence,
        registry: Registry,
        router: Arc<Router>,
        broker: Arc<dyn Broker>,
        codec: Serializer,
        max_loop_interval: Duration,
    ) -> Result<Self, crate::persistence::PersistenceError> {
        let mut schedule = persistence.load()?;
        Self::seed_from_registry(&mut schedule, &registry);
        Ok(Self {
            schedule: Mutex::new(schedule),
            persistence,
            registry,
            router,
            broker,
            codec,
            max_loop_interval,
            sync_every: Duration::from_secs(30),
        })
    }

    /// Register every periodic task in the Registry that doesn't already
    /// have a schedule entry, so a freshly registered periodic task is
    /// picked up without operator intervention.
    fn seed_from_registry(schedule: &mut HashMap<String, ScheduleEntry>, registry: &Registry) {
        for entry in registry.periodic_entries() {
            if schedule.contains_key(&entry.name) {
                continue;
            }
            let run_every = match entry.periodic {
                Some(foreman_registry::PeriodicSchedule::Interval(d)) => d,
                // Cron-like predicates are evaluated by the caller at tick
                // time in a full implementation; here they seed with a
                // one-minute check interval as a safe default.
                Some(foreman_registry::PeriodicSchedule::CronLike(_)) => Duration::from_secs(60),
                None => continue,
            };
            schedule.insert(entry.name.clone(), ScheduleEntry::new(entry.name.clone(), run_every));
        }
    }

    /// Run the tick loop until `shutdown` is cancelled. Syncs the
    /// schedule periodically and once more on the way out.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut last_sync = tokio::time::Instant::now();
        loop {
            let sleep_for = match self.tick().await {
                Ok(next) => next,
                Err(err) => {
                    error!(error = %err, "beat tick failed");
                    self.max_loop_interval
                }
            };

            if last_sync.elapsed() >= self.sync_every {
                self.sync().await;
                last_sync = tokio::time::Instant::now();
            }

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        self.cleanup().await;
        self.sync().await;
        info!("beat stopped");
    }

    /// One tick: dispatch every due entry, return how long to sleep
    /// before the next tick (`min(next_check, max_loop_interval)`).
    async fn tick(&self) -> Result<Duration, SchedulingError> {
        let now = Utc::now();
        let due_names: Vec<String>;
        let mut min_next_check = self.max_loop_interval.as_secs_f64();

        {
            let schedule = self.schedule.lock().await;
            let mut due = Vec::new();
            for entry in schedule.values() {
                let (is_due, next_check) = entry.is_due(now);
                if is_due {
                    due.push(entry.name.clone());
                } else {
                    min_next_check = min_next_check.min(next_check);
                }
            }
            due_names = due;
        }

        for name in due_names {
            match self.dispatch(&name, now).await {
                Ok(()) => {
                    let mut schedule = self.schedule.lock().await;
                    if let Some(entry) = schedule.get_mut(&name) {
                        entry.advance(now);
                    }
                }
                Err(err) => {
                    warn!(task_name = %name, error = %err, "scheduling error, leaving entry untouched");
                }
            }
        }

        Ok(Duration::from_secs_f64(min_next_check.max(0.0)))
    }

    async fn dispatch(&self, task_name: &str, _now: chrono::DateTime<Utc>) -> Result<(), SchedulingError> {
        let message = TaskMessage::new(task_name);
        let route = self.router.resolve(task_name);
        let body = self
            .codec
            .encode(&message)
            .map_err(|source| SchedulingError::Publish { name: task_name.to_string(), source })?;

        let properties = PublishProperties {
            content_type: self.codec.content_type().to_string(),
            delivery_mode: 2,
        };

        self.broker
            .publish(&route.exchange, &route.routing_key, body, properties)
            .await
            .map_err(|source| SchedulingError::Publish { name: task_name.to_string(), source })
    }

    async fn cleanup(&self) {
        let known = self.registry.names();
        let mut schedule = self.schedule.lock().await;
        crate::persistence::cleanup(&mut schedule, &known);
    }

    async fn sync(&self) {
        let schedule = self.schedule.lock().await;
        if let Err(err) = self.persistence.sync(&schedule) {
            warn!(error = %err, "failed to sync beat schedule");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_registry::QueueDescriptor;

    fn router() -> Arc<Router> {
        Arc::new(Router::new(vec![], QueueDescriptor::default_direct("default"), vec![QueueDescriptor::default_direct("default")], true))
    }

    #[tokio::test]
    async fn due_task_advances_and_dispatches() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = SchedulePersistence::new(dir.path().join("schedule.json"));
        let registry = Registry::new();
        let broker = Arc::new(foreman_broker::InMemoryBroker::new());
        broker.declare_exchange("default", foreman_registry::ExchangeType::Direct).await.unwrap();
        broker.declare_queue("default").await.unwrap();
        broker.bind("default", "default", "default").await.unwrap();

        let beat = Beat::new(persistence, registry, router(), broker.clone(), Serializer::Json, Duration::from_secs(5)).unwrap();
        {
            let mut schedule = beat.schedule.lock().await;
            schedule.insert("tick".into(), ScheduleEntry::new("tick", Duration::from_secs(0)));
        }

        beat.tick().await.unwrap();

        let schedule = beat.schedule.lock().await;
        assert_eq!(schedule["tick"].total_run_count, 1);
    }

    #[tokio::test]
    async fn publish_to_undeclared_exchange_still_advances() {
        // Fan-out to zero bound queues is not a publish error; only a
        // genuine broker failure should leave the entry untouched.
        let dir = tempfile::tempdir().unwrap();
        let persistence = SchedulePersistence::new(dir.path().join("schedule.json"));
        let registry = Registry::new();
        let broker = Arc::new(foreman_broker::InMemoryBroker::new());
        let beat = Beat::new(persistence, registry, router(), broker, Serializer::Json, Duration::from_secs(5)).unwrap();
        {
            let mut schedule = beat.schedule.lock().await;
            schedule.insert("tick".into(), ScheduleEntry::new("tick", Duration::from_secs(0)));
        }

        beat.tick().await.unwrap();
        let schedule = beat.schedule.lock().await;
        assert_eq!(schedule["tick"].total_run_count, 1);
    }
}
