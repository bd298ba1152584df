//! Operator commands for the node registry.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use stellar_core::node::health::health_report;
use stellar_core::node::{NodeManager, NodeManagerConfig};
use stellar_db::models::{NodeRole, NodeStatus};
use stellar_db::queries::nodes::{self, NodeFilter};

use crate::NodeCommands;

pub async fn run_node_command(command: NodeCommands, pool: &PgPool) -> Result<()> {
    match command {
        NodeCommands::List {
            status,
            role,
            tag,
            limit,
            offset,
        } => {
            let filter = NodeFilter {
                status: status
                    .as_deref()
                    .map(str::parse::<NodeStatus>)
                    .transpose()
                    .map_err(|e| anyhow::anyhow!(e))?,
                role: role
                    .as_deref()
                    .map(str::parse::<NodeRole>)
                    .transpose()
                    .map_err(|e| anyhow::anyhow!(e))?,
                tags: tag,
            };
            let (listed, total) = nodes::list_nodes(pool, &filter, limit, offset).await?;

            println!(
                "{:<38} {:<18} {:<10} {:<12} {:<8} NAME",
                "ID", "ADDRESS", "ROLE", "STATUS", "HEALTH"
            );
            for node in &listed {
                let health = health_report(node);
                println!(
                    "{:<38} {:<18} {:<10} {:<12} {:<8} {}",
                    node.id,
                    format!("{}:{}", node.address, node.port),
                    node.role,
                    node.status,
                    health.score,
                    node.name,
                );
            }
            println!("\n{} of {total} nodes shown.", listed.len());
        }
        NodeCommands::Show { node_id } => {
            let id = parse_id(&node_id)?;
            let node = nodes::get_node(pool, id)
                .await?
                .with_context(|| format!("node {node_id} not found"))?;
            let health = health_report(&node);

            println!("Node {} ({})", node.name, node.id);
            println!("  address:        {}:{}", node.address, node.port);
            println!("  role:           {}", node.role);
            println!("  status:         {}", node.status);
            println!("  tags:           {}", node.tags.join(", "));
            println!("  registered:     {}", node.registered_at);
            println!(
                "  last heartbeat: {}",
                node.last_heartbeat_at
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "never".into())
            );
            println!("  health score:   {}", health.score);
            for issue in &health.issues {
                println!("    - {issue}");
            }
            println!(
                "  telemetry:      cpu {:.1}%, mem {:.0} MB, {} running / {} queued",
                node.telemetry.cpu_percent,
                node.telemetry.memory_mb,
                node.telemetry.running_tasks,
                node.telemetry.queued_tasks,
            );
            println!(
                "  task stats:     {} total ({} ok, {} failed), avg {:.0} ms",
                node.task_stats.total,
                node.task_stats.succeeded,
                node.task_stats.failed,
                node.task_stats.avg_execution_ms,
            );
        }
        NodeCommands::Maintenance { node_id, off } => {
            let id = parse_id(&node_id)?;
            let manager = NodeManager::new(pool.clone(), NodeManagerConfig::default());
            if off {
                manager.leave_maintenance(id).await?;
                println!("Node {node_id} back online.");
            } else {
                manager.enter_maintenance(id).await?;
                println!("Node {node_id} in maintenance; no new work will be assigned.");
            }
        }
        NodeCommands::Cleanup { grace_secs } => {
            let removed = nodes::cleanup_offline(pool, grace_secs).await?;
            println!("Removed {removed} nodes offline longer than {grace_secs}s.");
        }
        NodeCommands::Stats => {
            let stats = nodes::registry_stats(pool).await?;
            println!("Fleet: {} nodes", stats.total);
            for (status, count) in &stats.per_status {
                println!("  {status}: {count}");
            }
            println!(
                "Tasks: {} lifetime, {} running, {} queued on nodes",
                stats.total_tasks, stats.running_tasks, stats.queued_tasks
            );
            println!(
                "Load (online avg): cpu {:.1}%, mem {:.0} MB",
                stats.avg_cpu, stats.avg_memory_mb
            );
        }
    }
    Ok(())
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid node ID: {raw}"))
}
