//! Prometheus metrics for the Pantry daemon.
//!
//! Counters cover reconciliation passes and their per-group results. The
//! `/metrics` endpoint is unauthenticated; restrict it at the network level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Pass metrics
pub static PASSES_STARTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pantry_reconcile_passes_started_total",
        "Total number of reconciliation passes started",
    )
    .expect("metric creation failed")
});

pub static PASSES_SKIPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pantry_reconcile_passes_skipped_total",
        "Total number of triggers skipped because a pass was already running",
    )
    .expect("metric creation failed")
});

pub static PASSES_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pantry_reconcile_passes_failed_total",
        "Total number of passes aborted by a pass-level error",
    )
    .expect("metric creation failed")
});

pub static PASSES_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pantry_reconcile_passes_reclaimed_total",
        "Total number of stale running passes whose lease was reclaimed",
    )
    .expect("metric creation failed")
});

pub static PASS_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "pantry_reconcile_pass_active",
        "Whether a reconciliation pass is running in this process",
    )
    .expect("metric creation failed")
});

pub static PASS_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "pantry_reconcile_pass_duration_seconds",
            "Time taken by one reconciliation pass",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
    )
    .expect("metric creation failed")
});

// Group and object metrics
pub static GROUPS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pantry_reconcile_groups_deleted_total",
        "Total number of expired groups removed",
    )
    .expect("metric creation failed")
});

pub static GROUPS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pantry_reconcile_groups_failed_total",
        "Total number of group removals that failed and were left for retry",
    )
    .expect("metric creation failed")
});

pub static GROUPS_DEFERRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pantry_reconcile_groups_deferred_total",
        "Total number of expired groups skipped by backoff, attempt limit or shutdown",
    )
    .expect("metric creation failed")
});

pub static OBJECTS_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pantry_reconcile_objects_deleted_total",
        "Total number of objects removed from the object store",
    )
    .expect("metric creation failed")
});

pub static OBJECT_DELETE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "pantry_reconcile_object_delete_failures_total",
        "Total number of object deletions that failed",
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests and embedded routers can call it freely.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(PASSES_STARTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PASSES_SKIPPED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PASSES_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PASSES_RECLAIMED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PASS_ACTIVE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PASS_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GROUPS_DELETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GROUPS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(GROUPS_DEFERRED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(OBJECTS_DELETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(OBJECT_DELETE_FAILURES.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}
