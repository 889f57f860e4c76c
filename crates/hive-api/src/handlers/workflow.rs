//! /workflow handlers.

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use hive_services::coordinator::WorkflowView;

use super::{ApiResult, ApiState};

// ── /workflow/start (POST) ───────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStartRequest {
    pub workflow_type: String,
    #[serde(default)]
    pub params_override: Option<serde_json::Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStartResponse {
    pub success: bool,
    pub workflow_id: String,
}

pub async fn handle_workflow_start(
    State(state): State<ApiState>,
    body: Result<Json<WorkflowStartRequest>, JsonRejection>,
) -> ApiResult<WorkflowStartResponse> {
    let Json(req) = body?;
    let workflow_id = state
        .coordinator
        .start_workflow(&req.workflow_type, req.params_override)?;
    Ok(Json(WorkflowStartResponse {
        success: true,
        workflow_id,
    }))
}

// ── /workflow/{id}/status (GET) ──────────────────────────────────────────────

pub async fn handle_workflow_status(
    State(state): State<ApiState>,
    id: Result<Path<String>, PathRejection>,
) -> ApiResult<WorkflowView> {
    let Path(id) = id?;
    Ok(Json(state.coordinator.workflow_view(&id)?))
}
