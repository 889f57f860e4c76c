//! Result cache commands.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, delete_json, get_json};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheStats {
    hits: u64,
    misses: u64,
    writes: u64,
    evictions: u64,
    bytes_saved: u64,
    entries: usize,
    hit_rate: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheInfo {
    entries: usize,
    stored_bytes: usize,
    original_bytes: usize,
    compressed_entries: usize,
    by_task_type: BTreeMap<String, TaskTypeUsage>,
    default_ttl_secs: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskTypeUsage {
    entries: usize,
    stored_bytes: usize,
}

#[derive(Deserialize)]
struct RemovedResponse {
    removed: usize,
}

pub async fn cmd_cache_stats(port: u16) -> Result<()> {
    let s: CacheStats = get_json(&format!("{}/cache/stats", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Cache Stats");
    println!("═══════════════════════════════════════");
    println!("  Entries     : {}", s.entries);
    println!("  Hits        : {}", s.hits);
    println!("  Misses      : {}", s.misses);
    println!("  Hit rate    : {:.1}%", s.hit_rate * 100.0);
    println!("  Writes      : {}", s.writes);
    println!("  Evictions   : {}", s.evictions);
    println!(
        "  Bytes saved : {} ({:.1} KB)",
        s.bytes_saved,
        s.bytes_saved as f64 / 1024.0
    );
    Ok(())
}

pub async fn cmd_cache_info(port: u16) -> Result<()> {
    let i: CacheInfo = get_json(&format!("{}/cache/info", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Cache Info");
    println!("═══════════════════════════════════════");
    println!("  Entries     : {} ({} compressed)", i.entries, i.compressed_entries);
    println!("  Stored      : {} bytes", i.stored_bytes);
    println!("  Original    : {} bytes", i.original_bytes);
    println!("  Default TTL : {}s", i.default_ttl_secs);
    if !i.by_task_type.is_empty() {
        println!();
        for (task_type, usage) in &i.by_task_type {
            println!(
                "  {:<24} {} entries, {} bytes",
                task_type, usage.entries, usage.stored_bytes
            );
        }
    }
    Ok(())
}

pub async fn cmd_cache_clear(port: u16) -> Result<()> {
    let resp: RemovedResponse =
        delete_json(&format!("{}/cache/clear", base_url(port)), &[]).await?;
    println!("Cleared {} entries from cache.", resp.removed);
    Ok(())
}

pub async fn cmd_cache_invalidate(port: u16, pattern: &str) -> Result<()> {
    let resp: RemovedResponse = delete_json(
        &format!("{}/cache/invalidate", base_url(port)),
        &[("pattern", pattern)],
    )
    .await?;
    println!("Invalidated {} entries matching {:?}.", resp.removed, pattern);
    Ok(())
}
