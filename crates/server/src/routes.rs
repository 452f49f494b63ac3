//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::routing::get;
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        // Health check (unauthenticated for load balancers/k8s probes)
        .route("/v1/health", get(handlers::health_check))
        // Pass history, read-only
        .route("/v1/reconcile/passes", get(handlers::list_passes))
        .route("/v1/reconcile/passes/{pass_id}", get(handlers::get_pass));

    // SECURITY: when enabled, restrict this endpoint to the Prometheus
    // scraper at the network level.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
