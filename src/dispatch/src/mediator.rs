//! Drains the Ready Queue into the Worker Pool, respecting rate-limit
//! admission and pool capacity, and reconciles pool completions: late
//! acks, handler-initiated retries, and failure logging.

use crate::listener::Listener;
use crate::ready_queue::ReadyItem;
use foreman_broker::{Broker, PublishProperties};
use foreman_events::{Event, EventDispatcher};
use foreman_pool::{Completion, EtaScheduler, RateLimiter, TaskOutcome, WorkerPool};
use foreman_registry::{retry_eta, Registry, Router, Serializer, TaskCounterSink};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Owns the three concurrent loops that connect the Ready Queue and ETA
/// scheduler to the Worker Pool: admission (ready -> pool), ETA release
/// (deferred entries -> ready queue), and reconciliation (pool
/// completions -> ack/retry/log, counter updates, and event emission).
pub struct Mediator {
    pool: Arc<WorkerPool>,
    rate_limiter: Arc<RateLimiter>,
    eta_scheduler: Arc<EtaScheduler>,
    listener: Arc<Listener>,
    registry: Registry,
    router: Arc<Router>,
    broker: Arc<dyn Broker>,
    codec: Serializer,
    events: Arc<EventDispatcher>,
    state: Arc<dyn TaskCounterSink>,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

impl Mediator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<WorkerPool>,
        rate_limiter: Arc<RateLimiter>,
        eta_scheduler: Arc<EtaScheduler>,
        listener: Arc<Listener>,
        registry: Registry,
        router: Arc<Router>,
        broker: Arc<dyn Broker>,
        codec: Serializer,
        events: Arc<EventDispatcher>,
        state: Arc<dyn TaskCounterSink>,
    ) -> Self {
        Self {
            pool,
            rate_limiter,
            eta_scheduler,
            listener,
            registry,
            router,
            broker,
            codec,
            events,
            state,
            retry_base_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(600),
        }
    }

    /// Spawn the admission, ETA release, and reconciliation loops. The
    /// Controller owns the returned join handles' lifetime.
    pub fn run(
        self: Arc<Self>,
        mut ready_rx: mpsc::Receiver<ReadyItem>,
        ready_tx: mpsc::Sender<ReadyItem>,
        eta_scheduler_precision: Duration,
    ) -> [tokio::task::JoinHandle<()>; 3] {
        let admission = {
            let mediator = self.clone();
            tokio::spawn(async move {
                while let Some(item) = ready_rx.recv().await {
                    mediator.admit_or_defer(item).await;
                }
            })
        };

        let release = {
            let mediator = self.clone();
            let ready_tx = ready_tx.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(eta_scheduler_precision).await;
                    let due = mediator.eta_scheduler.pop_due(SystemTime::now());
                    for message in due {
                        let Some(entry) = mediator.registry.get(&message.name) else {
                            warn!(task_id = %message.id, "task no longer registered, dropping");
                            continue;
                        };
                        if ready_tx.send(ReadyItem { message, entry }).await.is_err() {
                            break;
                        }
                    }
                }
            })
        };

        let reconcile = {
            let mediator = self.clone();
            let mut completions = self.pool.completions();
            tokio::spawn(async move {
                while let Some(completion) = completions.recv().await {
                    mediator.reconcile(completion).await;
                }
            })
        };

        [admission, release, reconcile]
    }

    async fn admit_or_defer(&self, item: ReadyItem) {
        if self.pool.is_revoked(&item.message.id) {
            info!(task_id = %item.message.id, "task revoked before admission");
            self.listener.complete(item.message.id, false).await;
            return;
        }

        if self.rate_limiter.try_admit(&item.message.name) {
            let task_id = item.message.id;
            if let Err(err) = self.pool.submit(item.message, item.entry) {
                error!(error = %err, "pool submission failed");
            } else {
                self.events.emit(Event::TaskStarted { task_id }).await;
            }
            return;
        }

        let delay = self.rate_limiter.retry_after(&item.message.name);
        let eta = SystemTime::now() + delay;
        info!(task_id = %item.message.id, delay = ?delay, "deferred by rate limit");
        self.eta_scheduler.enter(item.message, eta);
    }

    async fn reconcile(&self, completion: Completion) {
        let task_id = completion.task.id;
        let task_name = completion.task.name.clone();
        let runtime_secs = completion.runtime.as_secs_f64();
        match completion.outcome {
            TaskOutcome::Success(_) | TaskOutcome::SoftTimeLimitExceeded => {
                self.listener.complete(task_id, true).await;
                self.state.record_succeeded(&task_name);
                self.events.emit(Event::TaskSucceeded { task_id, runtime_secs }).await;
            }
            TaskOutcome::Failure(reason) => {
                warn!(task_id = %task_id, reason = %reason, "task failed");
                self.listener.complete(task_id, false).await;
                self.state.record_failed(&task_name);
                self.events.emit(Event::TaskFailed { task_id, reason }).await;
            }
            TaskOutcome::HardTimeLimitExceeded => {
                error!(task_id = %task_id, "hard time limit exceeded");
                self.listener.complete(task_id, false).await;
                self.state.record_failed(&task_name);
                self.events
                    .emit(Event::TaskFailed { task_id, reason: "hard time limit exceeded".to_string() })
                    .await;
            }
            TaskOutcome::WorkerLost => {
                error!(task_id = %task_id, "worker lost without reporting a result");
                self.listener.complete(task_id, false).await;
                self.state.record_failed(&task_name);
                self.events
                    .emit(Event::TaskFailed { task_id, reason: "worker lost".to_string() })
                    .await;
            }
            TaskOutcome::Revoked => {
                self.listener.complete(task_id, false).await;
                self.state.record_revoked(&task_name);
                self.events.emit(Event::TaskRevoked { task_id }).await;
            }
            TaskOutcome::Retry(delay) => {
                self.republish_retry(completion.task, delay).await;
                self.listener.complete(task_id, true).await;
                self.state.record_retried(&task_name);
            }
        }
    }

    /// Handler-initiated retry: republish a fresh message with an
    /// incremented retry count and a backoff-computed ETA, over the same
    /// producer path an external client would use. The original delivery
    /// is acked by the caller; redelivery is the new message's job.
    async fn republish_retry(&self, task: foreman_registry::TaskMessage, delay: Option<Duration>) {
        let now = SystemTime::now();
        let eta = match delay {
            Some(d) => now + d,
            None => retry_eta(now, task.retries, self.retry_base_delay, self.retry_max_delay),
        };
        let retried = task.for_retry(eta);
        let route = self.router.resolve(&retried.name);

        let body = match self.codec.encode(&retried) {
            Ok(b) => b,
            Err(err) => {
                error!(task_id = %retried.id, error = %err, "failed to encode retry message");
                return;
            }
        };

        let properties = PublishProperties {
            content_type: self.codec.content_type().to_string(),
            delivery_mode: 2,
        };

        if let Err(err) = self
            .broker
            .publish(&route.exchange, &route.routing_key, body, properties)
            .await
        {
            error!(task_id = %retried.id, error = %err, "failed to republish retry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_broker::InMemoryBroker;
    use foreman_registry::{ExchangeType, Handler, HandlerOutcome, QueueDescriptor, RegistryEntry, TaskMessage};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc as StdArc;

    #[derive(Default)]
    struct CountingSink {
        succeeded: AtomicU64,
        failed: AtomicU64,
        retried: AtomicU64,
        revoked: AtomicU64,
    }

    impl TaskCounterSink for CountingSink {
        fn record_succeeded(&self, _task_name: &str) {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        }
        fn record_failed(&self, _task_name: &str) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        fn record_retried(&self, _task_name: &str) {
            self.retried.fetch_add(1, Ordering::SeqCst);
        }
        fn record_revoked(&self, _task_name: &str) {
            self.revoked.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn default_route() -> QueueDescriptor {
        QueueDescriptor {
            name: "work".into(),
            exchange: "default".into(),
            exchange_type: ExchangeType::Direct,
            binding_key: "work".into(),
            routing_key: "work".into(),
        }
    }

    async fn harness(
        handler: Handler,
    ) -> (Arc<Mediator>, Arc<WorkerPool>, Arc<CountingSink>, mpsc::Receiver<foreman_broker::Delivery>) {
        let broker = Arc::new(InMemoryBroker::new());
        broker.declare_exchange("default", ExchangeType::Direct).await.unwrap();
        broker.declare_queue("work").await.unwrap();
        broker.bind("work", "default", "work").await.unwrap();

        let registry = Registry::new();
        registry.register(RegistryEntry::new("add", handler)).unwrap();

        let events = Arc::new(EventDispatcher::new(broker.clone(), true));
        events.declare_topology().await.unwrap();
        broker.declare_queue("events-probe").await.unwrap();
        broker.bind("events-probe", "foreman.events", "#").await.unwrap();
        let events_rx = broker.consume("events-probe", 8).await.unwrap();

        let listener = Listener::new(broker.clone(), registry.clone(), Serializer::Json, false, events.clone());
        let pool = Arc::new(WorkerPool::new(1, None));
        let router = Arc::new(Router::new(vec![], default_route(), vec![default_route()], false));
        let sink = Arc::new(CountingSink::default());

        let mediator = Arc::new(Mediator::new(
            pool.clone(),
            Arc::new(RateLimiter::new(None, true)),
            Arc::new(EtaScheduler::new()),
            listener,
            registry,
            router,
            broker,
            Serializer::Json,
            events,
            sink.clone(),
        ));

        (mediator, pool, sink, events_rx)
    }

    #[tokio::test]
    async fn successful_completion_records_counter_and_emits_event() {
        let handler: Handler = StdArc::new(|_a, _k| async { HandlerOutcome::Success(serde_json::json!(5)) }.boxed());
        let (mediator, pool, sink, mut events_rx) = harness(handler).await;

        let entry = mediator.registry.get("add").unwrap();
        let mut completions = pool.completions();
        pool.submit(TaskMessage::new("add"), entry).unwrap();
        let completion = completions.recv().await.unwrap();
        mediator.reconcile(completion).await;

        assert_eq!(sink.succeeded.load(Ordering::SeqCst), 1);
        let published = tokio::time::timeout(Duration::from_millis(200), events_rx.recv())
            .await
            .expect("an event should have been published")
            .expect("channel open");
        let record: serde_json::Value = serde_json::from_slice(&published.body).unwrap();
        assert_eq!(record["type"], "task-succeeded");
    }

    #[tokio::test]
    async fn failed_completion_records_counter_and_emits_event() {
        let handler: Handler =
            StdArc::new(|_a, _k| async { HandlerOutcome::Failure("boom".to_string()) }.boxed());
        let (mediator, pool, sink, mut events_rx) = harness(handler).await;

        let entry = mediator.registry.get("add").unwrap();
        let mut completions = pool.completions();
        pool.submit(TaskMessage::new("add"), entry).unwrap();
        let completion = completions.recv().await.unwrap();
        mediator.reconcile(completion).await;

        assert_eq!(sink.failed.load(Ordering::SeqCst), 1);
        let published = tokio::time::timeout(Duration::from_millis(200), events_rx.recv())
            .await
            .expect("an event should have been published")
            .expect("channel open");
        let record: serde_json::Value = serde_json::from_slice(&published.body).unwrap();
        assert_eq!(record["type"], "task-failed");
    }

    #[tokio::test]
    async fn revoked_completion_records_counter_without_touching_pool_outcome() {
        let handler: Handler =
            StdArc::new(|_a, _k| async { HandlerOutcome::Success(serde_json::Value::Null) }.boxed());
        let (mediator, pool, sink, _events_rx) = harness(handler).await;

        let task = TaskMessage::new("add");
        pool.revoke(task.id);
        let entry = mediator.registry.get("add").unwrap();
        let mut completions = pool.completions();
        pool.submit(task, entry).unwrap();
        let completion = completions.recv().await.unwrap();
        assert!(matches!(completion.outcome, TaskOutcome::Revoked));
        mediator.reconcile(completion).await;

        assert_eq!(sink.revoked.load(Ordering::SeqCst), 1);
    }
}
