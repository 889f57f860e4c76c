//! /cache handlers: result cache statistics and invalidation.

use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use hive_core::HiveError;
use hive_services::cache::CacheInfo;
use hive_services::CacheStats;

use super::{ApiResult, ApiState};

pub async fn handle_cache_stats(State(state): State<ApiState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

pub async fn handle_cache_info(State(state): State<ApiState>) -> Json<CacheInfo> {
    Json(state.cache.info())
}

#[derive(Deserialize)]
pub struct InvalidateQuery {
    pub pattern: Option<String>,
}

#[derive(Serialize)]
pub struct RemovedResponse {
    pub success: bool,
    pub removed: usize,
}

pub async fn handle_cache_invalidate(
    State(state): State<ApiState>,
    query: Result<Query<InvalidateQuery>, QueryRejection>,
) -> ApiResult<RemovedResponse> {
    let Query(query) = query?;
    let pattern = query
        .pattern
        .filter(|p| !p.is_empty())
        .ok_or_else(|| HiveError::Validation("query parameter \"pattern\" is required".into()))?;
    let removed = state.cache.invalidate(&pattern)?;
    Ok(Json(RemovedResponse {
        success: true,
        removed,
    }))
}

pub async fn handle_cache_clear(State(state): State<ApiState>) -> Json<RemovedResponse> {
    let removed = state.cache.clear();
    tracing::info!(removed, "cache cleared via API");
    Json(RemovedResponse {
        success: true,
        removed,
    })
}
