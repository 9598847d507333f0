use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::platform::config::WorkerConfig;
use crate::state::WorkerState;
use foreman_events::EventDispatcher;
use foreman_pool::{RateLimiter, WorkerPool};
use foreman_registry::Registry;

/// Shared handles every spawned service needs: configuration, the task
/// registry, the rate limiter, the worker pool, persisted state, and the
/// event dispatcher. Cheap to clone; `shutdown` is a child token so a
/// service can be cancelled independently of the root.
#[derive(Clone)]
pub struct WorkerContext {
    shared: Arc<SharedState>,
    shutdown: CancellationToken,
}

struct SharedState {
    config: WorkerConfig,
    registry: Registry,
    rate_limiter: Arc<RateLimiter>,
    pool: Arc<WorkerPool>,
    state: Arc<WorkerState>,
    events: Arc<EventDispatcher>,
}

impl WorkerContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: WorkerConfig,
        registry: Registry,
        rate_limiter: Arc<RateLimiter>,
        pool: Arc<WorkerPool>,
        state: Arc<WorkerState>,
        events: Arc<EventDispatcher>,
        shutdown: CancellationToken,
    ) -> Self {
        let shared = SharedState {
            config,
            registry,
            rate_limiter,
            pool,
            state,
            events,
        };

        Self {
            shared: Arc::new(shared),
            shutdown,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> Registry {
        self.shared.registry.clone()
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.shared.rate_limiter)
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        Arc::clone(&self.shared.pool)
    }

    pub fn state(&self) -> Arc<WorkerState> {
        Arc::clone(&self.shared.state)
    }

    pub fn events(&self) -> Arc<EventDispatcher> {
        Arc::clone(&self.shared.events)
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
