//! Workflow commands.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::http::{base_url, get_json, post_json_body};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    workflow_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params_override: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    workflow_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowView {
    id: String,
    #[serde(rename = "type")]
    workflow_type: String,
    status: String,
    phases: Vec<PhaseInfo>,
    error: Option<String>,
    tasks: Vec<TaskInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhaseInfo {
    name: String,
    parallel: bool,
    status: String,
    task_ids: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskInfo {
    id: String,
    #[serde(rename = "type")]
    task_type: String,
    target_node_id: String,
    status: String,
    retry_count: u32,
    error: Option<String>,
}

pub async fn cmd_workflow_start(port: u16, workflow_type: &str, params: Option<&str>) -> Result<()> {
    let params_override = params
        .map(serde_json::from_str)
        .transpose()
        .context("params must be a JSON object")?;
    let req = StartRequest {
        workflow_type: workflow_type.to_string(),
        params_override,
    };
    let resp: StartResponse =
        post_json_body(&format!("{}/workflow/start", base_url(port)), &req).await?;
    println!("Workflow started: {}", resp.workflow_id);
    Ok(())
}

pub async fn cmd_workflow_status(port: u16, id: &str) -> Result<()> {
    let w: WorkflowView = get_json(&format!("{}/workflow/{}/status", base_url(port), id)).await?;

    println!("═══════════════════════════════════════");
    println!("  Workflow {} ({})", w.id, w.workflow_type);
    println!("═══════════════════════════════════════");
    println!("  Status : {}", w.status);
    if let Some(e) = &w.error {
        println!("  Error  : {}", e);
    }

    for phase in &w.phases {
        let mode = if phase.parallel { "parallel" } else { "sequential" };
        println!("\n  ┌─ {} [{}] {}", phase.name, mode, phase.status);
        for task_id in &phase.task_ids {
            let Some(t) = w.tasks.iter().find(|t| &t.id == task_id) else {
                continue;
            };
            let retry = if t.retry_count > 0 {
                format!(" retry {}", t.retry_count)
            } else {
                String::new()
            };
            println!(
                "  │  {:<16} → {:<12} {}{}",
                t.task_type, t.target_node_id, t.status, retry
            );
            if let Some(e) = &t.error {
                println!("  │    {}", e);
            }
        }
        println!("  └─");
    }
    Ok(())
}
