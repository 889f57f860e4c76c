//! Hive status, activation and scaler commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

// ── Response types ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    active: bool,
    agents: Vec<AgentInfo>,
    queue: QueueInfo,
    workflows: WorkflowCounts,
    dead_letters: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentInfo {
    id: String,
    kind: String,
    status: String,
    last_heartbeat: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueInfo {
    depth: usize,
    avg_latency_ms: f64,
}

#[derive(Deserialize)]
struct WorkflowCounts {
    running: usize,
    completed: usize,
    failed: usize,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivateResponse {
    agents_online: usize,
    agents_expected: usize,
    degraded: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScalerResponse {
    samples: usize,
    averages: MetricSample,
    pools: Vec<PoolInfo>,
    scale_up_cooldown_remaining: u64,
    scale_down_cooldown_remaining: u64,
    last_decision: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricSample {
    cpu_percent: f64,
    memory_percent: f64,
    queue_depth: f64,
    avg_latency_ms: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolInfo {
    kind: String,
    instances: Vec<String>,
    min_instances: u32,
    max_instances: u32,
    queue_length: usize,
}

// ── Commands ──────────────────────────────────────────────────────────────────

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Hive Status");
    println!("═══════════════════════════════════════");
    println!("  Active       : {}", if resp.active { "yes" } else { "no" });
    println!("  Queue depth  : {}", resp.queue.depth);
    println!("  Avg latency  : {:.0} ms", resp.queue.avg_latency_ms);
    println!(
        "  Workflows    : {} running, {} completed, {} failed",
        resp.workflows.running, resp.workflows.completed, resp.workflows.failed
    );
    println!("  Dead letters : {}", resp.dead_letters);

    if resp.agents.is_empty() {
        println!("\n  No agents registered.");
    } else {
        println!("\n  Agents:");
        for a in &resp.agents {
            let icon = if a.status == "online" { "✓" } else { "✗" };
            println!(
                "  {} {:<20} {:<12} last heartbeat {}",
                icon, a.id, a.kind, a.last_heartbeat
            );
        }
    }

    Ok(())
}

pub async fn cmd_spawn_activate(port: u16) -> Result<()> {
    let resp: ActivateResponse =
        post_json(&format!("{}/spawn/activate", base_url(port))).await?;
    println!(
        "Hive activated: {}/{} agents online{}",
        resp.agents_online,
        resp.agents_expected,
        if resp.degraded { " (degraded)" } else { "" }
    );
    Ok(())
}

pub async fn cmd_spawn_deactivate(port: u16) -> Result<()> {
    let _: serde_json::Value = post_json(&format!("{}/spawn/deactivate", base_url(port))).await?;
    println!("Hive deactivated.");
    Ok(())
}

pub async fn cmd_scaler(port: u16) -> Result<()> {
    let resp: ScalerResponse = get_json(&format!("{}/scaler", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Scaler ({} samples)", resp.samples);
    println!("═══════════════════════════════════════");
    println!("  CPU      : {:.1}%", resp.averages.cpu_percent);
    println!("  Memory   : {:.1}%", resp.averages.memory_percent);
    println!("  Queue    : {:.1}", resp.averages.queue_depth);
    println!("  Latency  : {:.0} ms", resp.averages.avg_latency_ms);
    println!(
        "  Cooldown : up {}s, down {}s",
        resp.scale_up_cooldown_remaining, resp.scale_down_cooldown_remaining
    );
    if let Some(decision) = &resp.last_decision {
        println!("  Last     : {}", decision);
    }
    println!();
    for p in &resp.pools {
        println!(
            "  {:<10} {}/{}..{} instances, queue {}",
            p.kind,
            p.instances.len(),
            p.min_instances,
            p.max_instances,
            p.queue_length
        );
    }
    Ok(())
}
