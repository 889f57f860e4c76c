//! hive-ctl: command-line interface for the Hive coordinator.

use anyhow::{Context, Result};

mod cmd;

use cmd::{cache, status, workflow};

const DEFAULT_PORT: u16 = 9001;

fn print_usage() {
    println!("Usage: hive-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                          Show agents, queue and workflow counts");
    println!("  workflow start <type> [params]  Start a workflow, params as a JSON object");
    println!("  workflow status <id>            Show a workflow's phases and tasks");
    println!("  spawn activate                  Wait for agents and activate the hive");
    println!("  spawn deactivate                Deactivate and cancel in-flight tasks");
    println!("  cache stats                     Show cache hit/miss statistics");
    println!("  cache info                      Show cache contents by task type");
    println!("  cache clear                     Remove every cache entry");
    println!("  cache invalidate <pattern>      Remove entries matching a * glob");
    println!("  scaler                          Show scaler metrics and worker pools");
    println!();
    println!("Options:");
    println!("  --port <port>   Coordinator API port (default: {})", DEFAULT_PORT);
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse --port option
    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | [] => status::cmd_status(port).await,
        ["workflow", "start", kind] => workflow::cmd_workflow_start(port, kind, None).await,
        ["workflow", "start", kind, params] => {
            workflow::cmd_workflow_start(port, kind, Some(*params)).await
        }
        ["workflow", "status", id] => workflow::cmd_workflow_status(port, id).await,
        ["spawn", "activate"] => status::cmd_spawn_activate(port).await,
        ["spawn", "deactivate"] => status::cmd_spawn_deactivate(port).await,
        ["cache"] | ["cache", "stats"] => cache::cmd_cache_stats(port).await,
        ["cache", "info"] => cache::cmd_cache_info(port).await,
        ["cache", "clear"] => cache::cmd_cache_clear(port).await,
        ["cache", "invalidate", pattern] => cache::cmd_cache_invalidate(port, pattern).await,
        ["scaler"] => status::cmd_scaler(port).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
