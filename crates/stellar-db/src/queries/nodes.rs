//! Database query functions for the `nodes` table (the node registry).
//!
//! All mutations stamp `updated_at`. Status changes and heartbeat ingestion
//! use conditional WHERE clauses so concurrent writers serialize per node id
//! without explicit locks.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{Node, NodeConfigDecl, NodeRole, NodeStatus, NodeTaskStats, NodeTelemetry};

/// Parameters for inserting a newly registered node.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub address: String,
    pub port: i32,
    pub role: NodeRole,
    pub tags: Vec<String>,
    pub config: NodeConfigDecl,
    pub api_secret: String,
}

/// Insert a new node row in `registering` status. Returns the inserted node
/// with server-generated defaults (id, timestamps).
pub async fn insert_node(pool: &PgPool, new: &NewNode) -> Result<Node> {
    let node = sqlx::query_as::<_, Node>(
        "INSERT INTO nodes (name, address, port, role, tags, config, api_secret) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(&new.name)
    .bind(&new.address)
    .bind(new.port)
    .bind(new.role)
    .bind(&new.tags)
    .bind(Json(&new.config))
    .bind(&new.api_secret)
    .fetch_one(pool)
    .await
    .context("failed to insert node")?;

    Ok(node)
}

/// Fetch a single node by ID.
pub async fn get_node(pool: &PgPool, id: Uuid) -> Result<Option<Node>> {
    let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch node")?;

    Ok(node)
}

/// Filter for [`list_nodes`]. All fields are conjunctive; `None` matches all.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub status: Option<NodeStatus>,
    pub role: Option<NodeRole>,
    /// Nodes carrying *all* of these tags.
    pub tags: Vec<String>,
}

/// List nodes matching a filter with pagination. Returns `(nodes, total)`
/// where `total` counts all matches regardless of the page window.
pub async fn list_nodes(
    pool: &PgPool,
    filter: &NodeFilter,
    limit: i64,
    offset: i64,
) -> Result<(Vec<Node>, i64)> {
    let nodes = sqlx::query_as::<_, Node>(
        "SELECT * FROM nodes \
         WHERE ($1::text IS NULL OR status = $1) \
           AND ($2::text IS NULL OR role = $2) \
           AND (cardinality($3::text[]) = 0 OR tags @> $3) \
         ORDER BY registered_at ASC \
         LIMIT $4 OFFSET $5",
    )
    .bind(filter.status)
    .bind(filter.role)
    .bind(&filter.tags)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list nodes")?;

    let total: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM nodes \
         WHERE ($1::text IS NULL OR status = $1) \
           AND ($2::text IS NULL OR role = $2) \
           AND (cardinality($3::text[]) = 0 OR tags @> $3)",
    )
    .bind(filter.status)
    .bind(filter.role)
    .bind(&filter.tags)
    .fetch_one(pool)
    .await
    .context("failed to count nodes")?;

    Ok((nodes, total.0))
}

/// List all nodes in a given status.
pub async fn list_by_status(pool: &PgPool, status: NodeStatus) -> Result<Vec<Node>> {
    let nodes = sqlx::query_as::<_, Node>(
        "SELECT * FROM nodes WHERE status = $1 ORDER BY registered_at ASC",
    )
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list nodes by status")?;

    Ok(nodes)
}

/// Atomically transition a node's status. The update only applies when the
/// current status is one of `from`; returns the number of rows affected
/// (0 means the precondition did not hold).
pub async fn transition_status(
    pool: &PgPool,
    id: Uuid,
    from: &[NodeStatus],
    to: NodeStatus,
) -> Result<u64> {
    let from_strs: Vec<String> = from.iter().map(|s| s.to_string()).collect();
    let result = sqlx::query(
        "UPDATE nodes \
         SET status = $1, updated_at = NOW() \
         WHERE id = $2 AND status = ANY($3)",
    )
    .bind(to)
    .bind(id)
    .bind(&from_strs)
    .execute(pool)
    .await
    .context("failed to transition node status")?;

    Ok(result.rows_affected())
}

/// Record a heartbeat: update telemetry, version, and `last_heartbeat_at`.
///
/// The WHERE clause enforces per-node monotonicity: a heartbeat whose
/// timestamp is not strictly newer than the stored one is dropped (returns
/// 0 rows). This makes out-of-order delivery harmless.
pub async fn record_heartbeat(
    pool: &PgPool,
    id: Uuid,
    timestamp: DateTime<Utc>,
    telemetry: &NodeTelemetry,
    version: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE nodes \
         SET telemetry = $1, \
             version = COALESCE($2, version), \
             last_heartbeat_at = $3, \
             updated_at = NOW() \
         WHERE id = $4 \
           AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $3)",
    )
    .bind(Json(telemetry))
    .bind(version)
    .bind(timestamp)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to record heartbeat")?;

    Ok(result.rows_affected())
}

/// Replace a node's declared config.
pub async fn update_config(pool: &PgPool, id: Uuid, config: &NodeConfigDecl) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE nodes SET config = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(Json(config))
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update node config")?;

    Ok(result.rows_affected())
}

/// Replace a node's task statistics, conditional on the previous
/// `updated_at` value so concurrent read-modify-write cycles detect races.
pub async fn update_task_stats(
    pool: &PgPool,
    id: Uuid,
    stats: &NodeTaskStats,
    expected_updated_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE nodes \
         SET task_stats = $1, updated_at = NOW() \
         WHERE id = $2 AND updated_at = $3",
    )
    .bind(Json(stats))
    .bind(id)
    .bind(expected_updated_at)
    .execute(pool)
    .await
    .context("failed to update node task stats")?;

    Ok(result.rows_affected())
}

/// Online nodes whose last heartbeat is older than `factor` times their own
/// declared heartbeat interval. These are liveness-scan candidates for the
/// `online -> offline` transition.
pub async fn stale_online_nodes(pool: &PgPool, factor: f64) -> Result<Vec<Node>> {
    let nodes = sqlx::query_as::<_, Node>(
        "SELECT * FROM nodes \
         WHERE status = 'online' \
           AND (last_heartbeat_at IS NULL \
                OR last_heartbeat_at < \
                   NOW() - (config->>'heartbeat_interval_secs')::bigint * $1 * interval '1 second')",
    )
    .bind(factor)
    .fetch_all(pool)
    .await
    .context("failed to query stale online nodes")?;

    Ok(nodes)
}

/// The smallest declared heartbeat interval across all nodes, in seconds.
/// Drives the liveness scan cadence.
pub async fn min_heartbeat_interval_secs(pool: &PgPool) -> Result<Option<i64>> {
    let row: (Option<i64>,) = sqlx::query_as(
        "SELECT MIN((config->>'heartbeat_interval_secs')::bigint) FROM nodes \
         WHERE status IN ('online', 'registering')",
    )
    .fetch_one(pool)
    .await
    .context("failed to query min heartbeat interval")?;

    Ok(row.0)
}

/// Delete nodes that have been offline longer than `older_than_secs`.
/// Returns the number of rows removed.
pub async fn cleanup_offline(pool: &PgPool, older_than_secs: i64) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM nodes \
         WHERE status = 'offline' \
           AND COALESCE(last_heartbeat_at, updated_at) < NOW() - $1 * interval '1 second'",
    )
    .bind(older_than_secs)
    .execute(pool)
    .await
    .context("failed to clean up offline nodes")?;

    Ok(result.rows_affected())
}

/// Delete a node unconditionally (explicit unregister).
pub async fn delete_node(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM nodes WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete node")?;

    Ok(result.rows_affected())
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RegistryStats {
    pub total: i64,
    pub per_status: std::collections::HashMap<String, i64>,
    pub per_role: std::collections::HashMap<String, i64>,
    pub total_tasks: i64,
    pub running_tasks: i64,
    pub queued_tasks: i64,
    pub avg_cpu: f64,
    pub avg_memory_mb: f64,
}

/// Compute fleet-wide statistics. Telemetry lives in a JSONB column, so the
/// aggregation happens here rather than in SQL; fleets are small enough
/// that a full scan is fine.
pub async fn registry_stats(pool: &PgPool) -> Result<RegistryStats> {
    let nodes = sqlx::query_as::<_, Node>("SELECT * FROM nodes")
        .fetch_all(pool)
        .await
        .context("failed to fetch nodes for stats")?;

    let mut stats = RegistryStats {
        total: nodes.len() as i64,
        ..Default::default()
    };

    let mut online = 0i64;
    for node in &nodes {
        *stats.per_status.entry(node.status.to_string()).or_default() += 1;
        *stats.per_role.entry(node.role.to_string()).or_default() += 1;
        stats.total_tasks += node.task_stats.total;
        stats.running_tasks += i64::from(node.telemetry.running_tasks);
        stats.queued_tasks += i64::from(node.telemetry.queued_tasks);
        if node.status == NodeStatus::Online {
            online += 1;
            stats.avg_cpu += node.telemetry.cpu_percent;
            stats.avg_memory_mb += node.telemetry.memory_mb;
        }
    }
    if online > 0 {
        stats.avg_cpu /= online as f64;
        stats.avg_memory_mb /= online as f64;
    }

    Ok(stats)
}
