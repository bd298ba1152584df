//! The liveness coordinator loop.
//!
//! A single long-lived task scans the registry and demotes online nodes
//! whose heartbeats have stopped, publishing `node-offline` events the
//! scheduler consumes for reassignment. The scan cadence follows the
//! smallest declared heartbeat interval in the fleet.

use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use stellar_db::models::NodeStatus;
use stellar_db::queries::nodes as db;

use super::{NodeEvent, NodeManager};

/// Run the liveness loop until cancellation.
///
/// Each round:
/// 1. demote online nodes with `now - last_heartbeat > offline_factor ×
///    declared interval` to `offline` and emit [`NodeEvent::Offline`];
/// 2. evict nodes that have stayed offline past the grace window;
/// 3. sleep for the smallest declared heartbeat interval (or the fallback
///    when the fleet is empty).
pub async fn run_liveness_loop(manager: NodeManager, cancel: CancellationToken) {
    let pool = manager.pool().clone();
    tracing::info!("liveness loop started");

    loop {
        if let Err(e) = scan_once(&pool, &manager).await {
            tracing::error!(error = %e, "liveness scan failed");
        }

        let interval = scan_interval(&pool, &manager).await;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {
                tracing::info!("liveness loop stopped");
                return;
            }
        }
    }
}

/// One liveness scan: demote stale nodes, evict long-offline ones.
pub async fn scan_once(pool: &PgPool, manager: &NodeManager) -> anyhow::Result<()> {
    let stale = db::stale_online_nodes(pool, manager.config().offline_factor).await?;

    for node in stale {
        // Conditional: another writer (e.g. a racing heartbeat) wins.
        let rows =
            db::transition_status(pool, node.id, &[NodeStatus::Online], NodeStatus::Offline)
                .await?;
        if rows > 0 {
            tracing::warn!(
                node_id = %node.id,
                name = %node.name,
                last_heartbeat = ?node.last_heartbeat_at,
                "node offline: heartbeats stopped"
            );
            manager.emit(NodeEvent::Offline(node.id));
        }
    }

    let evicted =
        db::cleanup_offline(pool, manager.config().eviction_grace.as_secs() as i64).await?;
    if evicted > 0 {
        tracing::info!(count = evicted, "evicted long-offline nodes");
    }

    Ok(())
}

async fn scan_interval(pool: &PgPool, manager: &NodeManager) -> Duration {
    match db::min_heartbeat_interval_secs(pool).await {
        Ok(Some(secs)) if secs > 0 => Duration::from_secs(secs as u64),
        Ok(_) => manager.config().fallback_scan_interval,
        Err(e) => {
            tracing::error!(error = %e, "failed to read heartbeat intervals");
            manager.config().fallback_scan_interval
        }
    }
}
