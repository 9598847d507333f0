use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::platform::config::ObservabilitySettings;
use crate::platform::context::WorkerContext;
use crate::platform::runtime::ServiceRegistration;

pub fn telemetry_service(settings: ObservabilitySettings) -> ServiceRegistration {
    ServiceRegistration::new(
        "telemetry",
        Arc::new(move |ctx: WorkerContext, token: CancellationToken| {
            let settings = settings.clone();
            tokio::spawn(async move {
                let outcome: Result<()> = async {
                    if !settings.enable_metrics {
                        return Ok(());
                    }

                    let app = Router::new().route("/metrics", get(metrics_handler)).with_state(ctx);
                    let addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
                    let shutdown = token.clone();

                    let listener = tokio::net::TcpListener::bind(addr).await?;
                    info!(port = settings.metrics_port, "telemetry server started");

                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            shutdown.cancelled().await;
                            info!("shutting down telemetry server");
                        })
                        .await?;

                    Ok(())
                }
                .await;

                outcome
            })
        }),
    )
}

/// Prometheus exposition text read live from the pool's slot states and
/// the per-task-name counters in persisted state. Counters are summed
/// across every registered task name; per-name breakdowns are available
/// through `WorkerState::counters` for callers that want them.
async fn metrics_handler(State(ctx): State<WorkerContext>) -> String {
    let pool = ctx.pool();
    let active_slots = pool.active_slots();
    let total_slots = pool.slot_states().len();

    let state = ctx.state();
    let mut succeeded = 0u64;
    let mut failed = 0u64;
    let mut retried = 0u64;
    let mut revoked = 0u64;
    for name in ctx.registry().names() {
        let counters = state.counters(&name);
        succeeded += counters.succeeded;
        failed += counters.failed;
        retried += counters.retried;
        revoked += counters.revoked;
    }
    let total = succeeded + failed + revoked;

    format!(
        "# HELP foreman_pool_active_slots Number of busy or recycling worker pool slots\n\
         # TYPE foreman_pool_active_slots gauge\n\
         foreman_pool_active_slots {active_slots}\n\
         # HELP foreman_pool_slots Total configured worker pool slots\n\
         # TYPE foreman_pool_slots gauge\n\
         foreman_pool_slots {total_slots}\n\
         # HELP foreman_tasks_total Tasks that reached a terminal outcome\n\
         # TYPE foreman_tasks_total counter\n\
         foreman_tasks_total {total}\n\
         # HELP foreman_tasks_succeeded_total Tasks completed successfully\n\
         # TYPE foreman_tasks_succeeded_total counter\n\
         foreman_tasks_succeeded_total {succeeded}\n\
         # HELP foreman_tasks_failed_total Tasks that ended in failure\n\
         # TYPE foreman_tasks_failed_total counter\n\
         foreman_tasks_failed_total {failed}\n\
         # HELP foreman_tasks_retried_total Handler-initiated retries\n\
         # TYPE foreman_tasks_retried_total counter\n\
         foreman_tasks_retried_total {retried}\n\
         # HELP foreman_tasks_revoked_total Tasks skipped due to revocation\n\
         # TYPE foreman_tasks_revoked_total counter\n\
         foreman_tasks_revoked_total {revoked}\n"
    )
}
