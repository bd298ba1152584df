//! Node lifecycle management: registration, heartbeat ingestion, liveness
//! scanning, health scoring, and maintenance transitions.

pub mod health;
pub mod liveness;

pub use liveness::run_liveness_loop;

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use sqlx::PgPool;
use tokio::sync::broadcast;
use uuid::Uuid;

use stellar_db::models::{Node, NodeStatus, NodeTelemetry};
use stellar_db::queries::nodes as db;
use stellar_db::queries::nodes::NewNode;

use crate::error::{Error, Result};
use crate::protocol::{NodeHeartbeat, RegisterRequest, RegisterResponse};

/// Node manager configuration.
#[derive(Debug, Clone)]
pub struct NodeManagerConfig {
    /// Multiplier on a node's declared heartbeat interval before it is
    /// considered offline.
    pub offline_factor: f64,
    /// How long a node may stay offline before eviction.
    pub eviction_grace: Duration,
    /// Liveness scan cadence when no node has declared an interval yet.
    pub fallback_scan_interval: Duration,
}

impl Default for NodeManagerConfig {
    fn default() -> Self {
        Self {
            offline_factor: 3.0,
            eviction_grace: Duration::from_secs(24 * 60 * 60),
            fallback_scan_interval: Duration::from_secs(30),
        }
    }
}

/// State-change events the manager publishes for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    /// A node came online (first heartbeat, or recovery from offline).
    Online(Uuid),
    /// A node stopped heartbeating and was transitioned offline.
    Offline(Uuid),
}

/// The node manager. Cheap to clone; clones share the event channel.
#[derive(Clone)]
pub struct NodeManager {
    pool: PgPool,
    config: NodeManagerConfig,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeManager {
    pub fn new(pool: PgPool, config: NodeManagerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            pool,
            config,
            events,
        }
    }

    pub fn config(&self) -> &NodeManagerConfig {
        &self.config
    }

    /// Subscribe to node state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        // Nobody listening is fine (e.g. CLI one-shots).
        let _ = self.events.send(event);
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Handle a registration request: assign a fresh id and secret, persist
    /// the node as `registering`, and return both. Name collisions are
    /// allowed; nodes are audited by id.
    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse> {
        if req.name.trim().is_empty() {
            return Err(Error::Validation("node name must not be empty".into()));
        }
        if req.ip.trim().is_empty() {
            return Err(Error::Validation("node address must not be empty".into()));
        }
        if !(1..=65535).contains(&req.port) {
            return Err(Error::Validation(format!("invalid port {}", req.port)));
        }
        let config = req.config.clone().unwrap_or_default();
        if config.heartbeat_interval_secs <= 0 {
            return Err(Error::Validation(
                "heartbeat interval must be positive".into(),
            ));
        }
        if config.max_concurrent_tasks <= 0 {
            return Err(Error::Validation(
                "max concurrent tasks must be positive".into(),
            ));
        }

        let api_secret = generate_api_secret();
        let node = db::insert_node(
            &self.pool,
            &NewNode {
                name: req.name.clone(),
                address: req.ip.clone(),
                port: req.port,
                role: req.role,
                tags: req.tags.clone(),
                config,
                api_secret: api_secret.clone(),
            },
        )
        .await
        .map_err(Error::Internal)?;

        tracing::info!(
            node_id = %node.id,
            name = %node.name,
            role = %node.role,
            "node registered"
        );

        Ok(RegisterResponse {
            node_id: node.id,
            api_key: api_secret,
            status: node.status,
            message: "registered; send a heartbeat to come online".into(),
        })
    }

    /// Look up a node and verify its bearer secret.
    pub async fn authenticate(&self, node_id: Uuid, api_key: &str) -> Result<Node> {
        let node = db::get_node(&self.pool, node_id)
            .await
            .map_err(Error::Internal)?
            .ok_or_else(|| Error::NotFound(format!("node {node_id}")))?;
        if node.api_secret != api_key {
            return Err(Error::Validation("invalid api key".into()));
        }
        Ok(node)
    }

    /// Ingest a heartbeat for an already-authenticated node.
    ///
    /// Drops out-of-order heartbeats ([`Error::Conflict`]) and transitions
    /// `registering`/`offline` nodes to `online` on any accepted one.
    pub async fn heartbeat(&self, node: &Node, hb: &NodeHeartbeat) -> Result<()> {
        if hb.node_id != node.id {
            return Err(Error::Validation(format!(
                "heartbeat node id {} does not match {}",
                hb.node_id, node.id
            )));
        }
        if !(0.0..=100.0).contains(&hb.cpu_percent) {
            return Err(Error::Validation(format!(
                "cpu percent out of range: {}",
                hb.cpu_percent
            )));
        }
        if hb.memory_mb < 0.0 || hb.running_tasks < 0 || hb.queued_tasks < 0 {
            return Err(Error::Validation("negative telemetry values".into()));
        }

        let telemetry = NodeTelemetry {
            cpu_percent: hb.cpu_percent,
            memory_mb: hb.memory_mb,
            disk_mb: hb.disk_mb,
            load_average: hb.load_average,
            running_tasks: hb.running_tasks,
            queued_tasks: hb.queued_tasks,
            network_in_kbps: hb.network_in_kbps,
            network_out_kbps: hb.network_out_kbps,
            uptime_secs: hb.uptime_secs,
            reported_at: Some(hb.timestamp),
        };

        let rows = db::record_heartbeat(
            &self.pool,
            node.id,
            hb.timestamp,
            &telemetry,
            hb.version.as_deref(),
        )
        .await
        .map_err(Error::Internal)?;

        if rows == 0 {
            return Err(Error::Conflict(format!(
                "stale heartbeat for node {}: timestamp {} is not newer than the stored one",
                node.id, hb.timestamp
            )));
        }

        // Any accepted heartbeat brings a registering or offline node online.
        let promoted = db::transition_status(
            &self.pool,
            node.id,
            &[NodeStatus::Registering, NodeStatus::Offline],
            NodeStatus::Online,
        )
        .await
        .map_err(Error::Internal)?;

        if promoted > 0 {
            tracing::info!(node_id = %node.id, "node online");
            self.emit(NodeEvent::Online(node.id));
        }

        Ok(())
    }

    /// Deliberate `online -> maintenance` transition. Running tasks are left
    /// on the node; the scheduler just stops assigning new work.
    pub async fn enter_maintenance(&self, node_id: Uuid) -> Result<()> {
        let rows = db::transition_status(
            &self.pool,
            node_id,
            &[NodeStatus::Online],
            NodeStatus::Maintenance,
        )
        .await
        .map_err(Error::Internal)?;
        if rows == 0 {
            return Err(Error::Conflict(format!(
                "node {node_id} is not online; cannot enter maintenance"
            )));
        }
        tracing::info!(node_id = %node_id, "node entering maintenance");
        Ok(())
    }

    /// Leave maintenance. The node returns to `online` immediately; the
    /// liveness loop will demote it again if heartbeats have stopped.
    pub async fn leave_maintenance(&self, node_id: Uuid) -> Result<()> {
        let rows = db::transition_status(
            &self.pool,
            node_id,
            &[NodeStatus::Maintenance],
            NodeStatus::Online,
        )
        .await
        .map_err(Error::Internal)?;
        if rows == 0 {
            return Err(Error::Conflict(format!(
                "node {node_id} is not in maintenance"
            )));
        }
        self.emit(NodeEvent::Online(node_id));
        Ok(())
    }

    /// Explicit unregister: the node row is removed. The scheduler learns
    /// about any owned tasks through the offline event.
    pub async fn unregister(&self, node_id: Uuid) -> Result<()> {
        let rows = db::delete_node(&self.pool, node_id)
            .await
            .map_err(Error::Internal)?;
        if rows == 0 {
            return Err(Error::NotFound(format!("node {node_id}")));
        }
        self.emit(NodeEvent::Offline(node_id));
        tracing::info!(node_id = %node_id, "node unregistered");
        Ok(())
    }

    /// Update a node's aggregate task statistics after a task terminates.
    ///
    /// Node rows are serialized per id through a conditional write on
    /// `updated_at`; on a lost race the cycle re-reads and retries once.
    pub async fn record_task_outcome(
        &self,
        node_id: Uuid,
        task_type: &str,
        success: bool,
        execution_ms: f64,
    ) -> Result<()> {
        for _ in 0..2 {
            let Some(node) = db::get_node(&self.pool, node_id)
                .await
                .map_err(Error::Internal)?
            else {
                return Ok(()); // node evicted; nothing to record
            };

            let mut stats = node.task_stats.0.clone();
            let prior = stats.total as f64;
            stats.total += 1;
            if success {
                stats.succeeded += 1;
            } else {
                stats.failed += 1;
            }
            *stats.per_type.entry(task_type.to_owned()).or_default() += 1;
            stats.avg_execution_ms =
                (stats.avg_execution_ms * prior + execution_ms) / stats.total as f64;
            stats.last_task_at = Some(Utc::now());

            let rows = db::update_task_stats(&self.pool, node_id, &stats, node.updated_at)
                .await
                .map_err(Error::Internal)?;
            if rows > 0 {
                return Ok(());
            }
        }
        Err(Error::Conflict(format!(
            "lost the task-stats update race twice for node {node_id}"
        )))
    }
}

/// Generate a node bearer secret: 32 random bytes, hex-encoded.
pub fn generate_api_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_secret_is_64_hex_chars() {
        let secret = generate_api_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn api_secrets_are_random() {
        assert_ne!(generate_api_secret(), generate_api_secret());
    }

    #[test]
    fn default_config_matches_contract() {
        let cfg = NodeManagerConfig::default();
        assert_eq!(cfg.offline_factor, 3.0);
        assert_eq!(cfg.eviction_grace, Duration::from_secs(86_400));
    }
}
