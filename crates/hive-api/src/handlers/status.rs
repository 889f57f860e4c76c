//! /status, /spawn and /scaler handlers.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use hive_core::HiveError;
use hive_services::coordinator::{ActivationReport, HiveStatus};
use hive_services::ScalerReport;

use super::{ApiResult, ApiState};

// ── /status ──────────────────────────────────────────────────────────────────

pub async fn handle_status(State(state): State<ApiState>) -> Json<HiveStatus> {
    Json(state.coordinator.status())
}

// ── /spawn/activate, /spawn/deactivate ───────────────────────────────────────

#[derive(Serialize)]
pub struct ActivateResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: ActivationReport,
}

pub async fn handle_activate(State(state): State<ApiState>) -> Json<ActivateResponse> {
    let report = state.coordinator.activate().await;
    Json(ActivateResponse {
        success: true,
        report,
    })
}

#[derive(Serialize)]
pub struct DeactivateResponse {
    pub success: bool,
    pub active: bool,
}

pub async fn handle_deactivate(State(state): State<ApiState>) -> Json<DeactivateResponse> {
    state.coordinator.deactivate();
    Json(DeactivateResponse {
        success: true,
        active: false,
    })
}

// ── /scaler ──────────────────────────────────────────────────────────────────

pub async fn handle_scaler(State(state): State<ApiState>) -> ApiResult<ScalerReport> {
    let scaler = state
        .scaler
        .as_ref()
        .ok_or_else(|| HiveError::NotFound("scaler is not enabled".into()))?;
    Ok(Json(scaler.report().await))
}
