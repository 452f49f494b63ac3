//! Health endpoint.

use crate::state::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

/// Status of one dependency.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub backend: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub metadata: ComponentHealth,
    pub storage: ComponentHealth,
}

/// GET /v1/health - Health check.
///
/// Unauthenticated, for load balancers and orchestrator probes. Returns 503
/// when either store is unreachable.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (metadata_result, storage_result) =
        tokio::join!(state.metadata.health_check(), state.storage.health_check());

    let metadata = ComponentHealth {
        backend: state.metadata.backend_name(),
        ok: metadata_result.is_ok(),
        error: metadata_result.err().map(|e| e.to_string()),
    };
    let storage = ComponentHealth {
        backend: state.storage.backend_name(),
        ok: storage_result.is_ok(),
        error: storage_result.err().map(|e| e.to_string()),
    };

    let healthy = metadata.ok && storage.ok;
    if !healthy {
        tracing::warn!(
            metadata_error = ?metadata.error,
            storage_error = ?storage.error,
            "Health check failed"
        );
    }

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            metadata,
            storage,
        }),
    )
}
