//! Read-only view of reconciliation pass records.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Query, State};
use pantry_metadata::models::PassRow;
use pantry_metadata::repos::PassStats;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

const DEFAULT_PASS_LIMIT: u32 = 20;
const MAX_PASS_LIMIT: u32 = 500;

/// Query parameters for listing passes.
#[derive(Debug, Deserialize)]
pub struct ListPassesQuery {
    pub limit: Option<u32>,
}

/// A reconciliation pass as returned by the API.
#[derive(Debug, Serialize)]
pub struct PassResponse {
    pub pass_id: Uuid,
    pub state: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub stats: Option<PassStats>,
}

impl From<PassRow> for PassResponse {
    fn from(row: PassRow) -> Self {
        // Rows written by older binaries may carry stats this one cannot parse.
        let stats = row
            .stats_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok());
        Self {
            pass_id: row.pass_id,
            state: row.state,
            started_at: row.started_at,
            finished_at: row.finished_at,
            stats,
        }
    }
}

/// GET /v1/reconcile/passes - Most recent passes, newest first.
pub async fn list_passes(
    State(state): State<AppState>,
    Query(query): Query<ListPassesQuery>,
) -> ApiResult<Json<Vec<PassResponse>>> {
    let limit = query.limit.unwrap_or(DEFAULT_PASS_LIMIT);
    if limit == 0 || limit > MAX_PASS_LIMIT {
        return Err(ApiError::BadRequest(format!(
            "limit must be between 1 and {MAX_PASS_LIMIT}"
        )));
    }

    let passes = state.metadata.get_recent_passes(limit).await?;
    Ok(Json(passes.into_iter().map(PassResponse::from).collect()))
}

/// GET /v1/reconcile/passes/{pass_id} - One pass record.
pub async fn get_pass(
    State(state): State<AppState>,
    Path(pass_id): Path<Uuid>,
) -> ApiResult<Json<PassResponse>> {
    let pass = state
        .metadata
        .get_pass(pass_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("pass {pass_id} not found")))?;
    Ok(Json(pass.into()))
}
