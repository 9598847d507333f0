use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::platform::config::WorkerConfig;
use crate::platform::context::WorkerContext;
use crate::platform::telemetry::telemetry_service;
use crate::state::WorkerState;

use foreman_beat::{Beat, SchedulePersistence};
use foreman_broker::{Broker, InMemoryBroker, ReconnectPolicy};
use foreman_dispatch::{ready_queue, Listener, Mediator};
use foreman_events::{Event, EventDispatcher};
use foreman_pool::{EtaScheduler, RateLimiter, WorkerPool};
use foreman_registry::{ExchangeType, QueueDescriptor, Registry, Router, TaskId};

/// One caller-registered background service: a name and a spawner closure
/// that turns a [`WorkerContext`] and cancellation token into a running
/// task. The telemetry HTTP server is the one the platform registers
/// itself; callers can add more (a health-check listener, a custom
/// exporter) through [`Platform::register_service`].
pub type ServiceSpawner =
    Arc<dyn Fn(WorkerContext, CancellationToken) -> JoinHandle<Result<()>> + Send + Sync + 'static>;

pub struct ServiceRegistration {
    name: String,
    spawner: ServiceSpawner,
}

impl ServiceRegistration {
    pub fn new<N: Into<String>>(name: N, spawner: ServiceSpawner) -> Self {
        Self { name: name.into(), spawner }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spawn(&self, context: WorkerContext, token: CancellationToken) -> JoinHandle<Result<()>> {
        (self.spawner)(context, token)
    }
}

/// Builds and owns the worker's service list; `start` wires the broker
/// topology, core engine (listener, mediator, optional beat), and
/// whatever services were registered, then hands back a running
/// [`PlatformRuntime`].
pub struct Platform {
    config: WorkerConfig,
    registry: Registry,
    services: Vec<ServiceRegistration>,
}

impl Platform {
    pub fn new(config: WorkerConfig, registry: Registry) -> Self {
        let mut services = Vec::new();
        services.push(telemetry_service(config.observability.clone()));

        Self { config, registry, services }
    }

    pub fn register_service(&mut self, service: ServiceRegistration) {
        self.services.push(service);
    }

    pub async fn start(self) -> Result<PlatformRuntime> {
        initialize_logging(&self.config);

        let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
        ReconnectPolicy::default().connect_with_retry(broker.as_ref()).await?;

        let routing = self.config.routing.clone();
        let exchange_type = parse_exchange_type(&routing.default_exchange_type);

        broker.declare_exchange(&routing.default_exchange, exchange_type).await?;
        broker.declare_queue(&routing.default_queue).await?;
        broker
            .bind(&routing.default_queue, &routing.default_exchange, &routing.default_routing_key)
            .await?;

        let default_route = QueueDescriptor {
            name: routing.default_queue.clone(),
            exchange: routing.default_exchange.clone(),
            exchange_type,
            binding_key: routing.default_routing_key.clone(),
            routing_key: routing.default_routing_key.clone(),
        };
        let router = Arc::new(Router::new(
            vec![],
            default_route.clone(),
            vec![default_route],
            routing.create_missing_queues,
        ));

        let rate_limiter = Arc::new(RateLimiter::new(
            self.config.rate_limiting.default_rate_limit_per_sec,
            self.config.rate_limiting.disable_rate_limits,
        ));
        let eta_scheduler = Arc::new(EtaScheduler::new());
        let pool = Arc::new(WorkerPool::new(
            self.config.concurrency.worker_concurrency,
            self.config.concurrency.max_tasks_per_child,
        ));

        let state = Arc::new(WorkerState::load(self.config.state.state_db.clone())?);
        for task_id in state.revoked_ids() {
            pool.revoke(task_id);
        }

        let events = Arc::new(EventDispatcher::new(broker.clone(), self.config.observability.send_events));
        events.declare_topology().await?;

        let codec = self.config.serialization.serializer();
        let listener = Listener::new(
            broker.clone(),
            self.registry.clone(),
            codec,
            self.config.concurrency.acks_late,
            events.clone(),
        );

        let prefetch = self.config.concurrency.prefetch();
        let (ready_tx, ready_rx) = ready_queue(prefetch);

        let mediator = Arc::new(Mediator::new(
            pool.clone(),
            rate_limiter.clone(),
            eta_scheduler.clone(),
            listener.clone(),
            self.registry.clone(),
            router.clone(),
            broker.clone(),
            codec,
            events.clone(),
            state.clone(),
        ));

        let root_token = CancellationToken::new();
        let context = WorkerContext::new(
            self.config.clone(),
            self.registry.clone(),
            rate_limiter.clone(),
            pool.clone(),
            state.clone(),
            events.clone(),
            root_token.child_token(),
        );

        let mut engine_tasks: Vec<(String, JoinHandle<()>)> = Vec::new();
        let eta_precision = self.config.time_limits.eta_scheduler_precision();
        engine_tasks.push((
            "listener".to_string(),
            listener.run(routing.default_queue.clone(), prefetch, ready_tx.clone(), eta_scheduler.clone()),
        ));
        let mediator_labels = ["mediator-admission", "mediator-release", "mediator-reconcile"];
        for (label, handle) in mediator_labels.into_iter().zip(mediator.run(ready_rx, ready_tx, eta_precision)) {
            engine_tasks.push((label.to_string(), handle));
        }

        if self.config.beat.enabled {
            let persistence = SchedulePersistence::new(self.config.beat.schedule_filename.clone());
            let beat = Arc::new(Beat::new(
                persistence,
                self.registry.clone(),
                router.clone(),
                broker.clone(),
                codec,
                Duration::from_secs(self.config.beat.max_loop_interval_secs),
            )?);
            let beat_token = root_token.child_token();
            let beat_handle: JoinHandle<()> = tokio::spawn(async move {
                beat.run(beat_token).await;
            });
            engine_tasks.push(("beat".to_string(), beat_handle));
        }

        let mut services: Vec<(String, JoinHandle<Result<()>>)> = Vec::new();
        for service in &self.services {
            let handle = service.spawn(context.clone(), root_token.child_token());
            services.push((service.name().to_string(), handle));
        }

        let worker_id = Uuid::new_v4();
        events
            .emit(Event::WorkerOnline { worker_id, hostname: self.config.metadata.hostname.clone() })
            .await;

        info!("worker boot completed");

        Ok(PlatformRuntime {
            worker_id,
            context,
            cancel_token: root_token,
            engine_tasks,
            services,
            pool,
            state,
            hard_time_limit: self.config.time_limits.hard_limit(),
        })
    }
}

fn parse_exchange_type(name: &str) -> ExchangeType {
    match name {
        "topic" => ExchangeType::Topic,
        "fanout" => ExchangeType::Fanout,
        _ => ExchangeType::Direct,
    }
}

/// A running worker: the spawned engine tasks (listener, mediator loops,
/// optional beat) plus any registered services (telemetry and whatever
/// the caller added).
pub struct PlatformRuntime {
    worker_id: Uuid,
    context: WorkerContext,
    cancel_token: CancellationToken,
    engine_tasks: Vec<(String, JoinHandle<()>)>,
    services: Vec<(String, JoinHandle<Result<()>>)>,
    pool: Arc<WorkerPool>,
    state: Arc<WorkerState>,
    hard_time_limit: Option<Duration>,
}

/// Upper bound on how long a warm shutdown waits for in-flight pool
/// slots to drain when no per-task hard time limit is configured.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

impl PlatformRuntime {
    pub fn context(&self) -> WorkerContext {
        self.context.clone()
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }

    /// Revoke a task id, both in the pool's live set (so an in-flight
    /// submission is skipped) and in persisted state (so it stays
    /// revoked across a restart).
    pub fn revoke(&self, task_id: TaskId) {
        self.pool.revoke(task_id);
        self.state.revoke(task_id);
        if let Err(err) = self.state.sync() {
            warn!(error = %err, "failed to persist revocation");
        }
    }

    /// Warm shutdown: stop admitting new work, then wait for whatever the
    /// pool already has in flight to finish (bounded by the configured
    /// hard time limit plus a grace period) before tearing down the
    /// reconcile loop, so a task that reports success mid-shutdown still
    /// gets its late ack finalized. Services are drained first since they
    /// carry their own cancellation plumbing; the engine loops do not.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel_token.cancel();
        self.context
            .events()
            .emit(Event::WorkerOffline { worker_id: self.worker_id })
            .await;

        for (name, handle) in self.services {
            match handle.await {
                Ok(Ok(())) => info!(service = %name, "service shutdown cleanly"),
                Ok(Err(err)) => return Err(err),
                Err(err) => return Err(err.into()),
            }
        }

        let mut reconcile = None;
        for (name, handle) in self.engine_tasks {
            if name == "mediator-reconcile" {
                reconcile = Some((name, handle));
                continue;
            }
            handle.abort();
            info!(task = %name, "engine task stopped");
        }

        let drain_timeout = self.hard_time_limit.unwrap_or(DEFAULT_DRAIN_TIMEOUT) + Duration::from_secs(5);
        let drained = tokio::time::timeout(drain_timeout, async {
            while self.pool.active_slots() > 0 {
                tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(active = self.pool.active_slots(), "warm shutdown timed out waiting for in-flight tasks");
        }

        if let Some((name, handle)) = reconcile {
            handle.abort();
            info!(task = %name, "engine task stopped");
        }

        if let Err(err) = self.state.sync() {
            warn!(error = %err, "failed to persist worker state on shutdown");
        }

        Ok(())
    }
}

fn initialize_logging(config: &WorkerConfig) {
    let filter = &config.observability.log_level;
    let _ = tracing_subscriber::fmt().with_env_filter(filter.as_str()).try_init();
}
