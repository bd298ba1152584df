//! The node assignment policy.
//!
//! For each pending assignment the scheduler picks the online node that
//! (1) has the task's type enabled, (2) has spare concurrency, and
//! (3) carries the lowest load score, breaking ties by the most recent
//! heartbeat.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use stellar_db::models::{Node, NodeStatus, TaskType};

/// A node's load snapshot used during one assignment pass.
///
/// `committed` counts tasks the node already owns plus assignments made
/// earlier in the same pass, so one pass cannot oversubscribe a node.
#[derive(Debug, Clone)]
pub struct NodeLoad {
    pub id: Uuid,
    pub enabled_types: Vec<TaskType>,
    pub max_concurrent: i32,
    pub committed: i32,
    pub cpu_percent: f64,
    pub memory_pct: f64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl NodeLoad {
    /// Build a snapshot from a node row plus the store's count of tasks it
    /// currently owns.
    pub fn from_node(node: &Node, owned_tasks: i64) -> Option<Self> {
        if node.status != NodeStatus::Online {
            return None;
        }
        let max_mem = node.config.max_memory_mb as f64;
        let memory_pct = if max_mem > 0.0 {
            node.telemetry.memory_mb / max_mem * 100.0
        } else {
            0.0
        };
        // Telemetry lags the store; trust whichever is higher.
        let committed = i64::from(node.telemetry.running_tasks).max(owned_tasks) as i32;
        Some(Self {
            id: node.id,
            enabled_types: node.config.enabled_task_types.clone(),
            max_concurrent: node.config.max_concurrent_tasks,
            committed,
            cpu_percent: node.telemetry.cpu_percent,
            memory_pct,
            last_heartbeat_at: node.last_heartbeat_at,
        })
    }

    /// Load score: lower is better.
    pub fn load_score(&self) -> f64 {
        let capacity_ratio = if self.max_concurrent > 0 {
            f64::from(self.committed) / f64::from(self.max_concurrent)
        } else {
            1.0
        };
        0.5 * self.cpu_percent + 0.3 * self.memory_pct + 0.2 * capacity_ratio
    }

    fn qualifies(&self, task_type: TaskType) -> bool {
        self.enabled_types.contains(&task_type) && self.committed < self.max_concurrent
    }
}

/// Pick the index of the best node for a task of `task_type`, or `None` when
/// no node qualifies (the task stays queued).
pub fn select_node(task_type: TaskType, candidates: &[NodeLoad]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        if !candidate.qualifies(task_type) {
            continue;
        }
        match best {
            None => best = Some(i),
            Some(b) => {
                let current = &candidates[b];
                let score = candidate.load_score();
                let best_score = current.load_score();
                if score < best_score
                    || (score == best_score
                        && candidate.last_heartbeat_at > current.last_heartbeat_at)
                {
                    best = Some(i);
                }
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn load(cpu: f64, mem: f64, committed: i32) -> NodeLoad {
        NodeLoad {
            id: Uuid::new_v4(),
            enabled_types: vec![TaskType::SubdomainEnum],
            max_concurrent: 4,
            committed,
            cpu_percent: cpu,
            memory_pct: mem,
            last_heartbeat_at: Some(Utc::now()),
        }
    }

    #[test]
    fn picks_lowest_load() {
        let candidates = vec![load(80.0, 50.0, 1), load(10.0, 10.0, 0), load(50.0, 50.0, 2)];
        assert_eq!(select_node(TaskType::SubdomainEnum, &candidates), Some(1));
    }

    #[test]
    fn skips_wrong_task_type() {
        let mut only_ports = load(0.0, 0.0, 0);
        only_ports.enabled_types = vec![TaskType::PortScan];
        let candidates = vec![only_ports, load(90.0, 90.0, 3)];
        assert_eq!(select_node(TaskType::SubdomainEnum, &candidates), Some(1));
        assert_eq!(select_node(TaskType::PortScan, &candidates), Some(0));
    }

    #[test]
    fn skips_full_nodes() {
        let candidates = vec![load(0.0, 0.0, 4), load(50.0, 50.0, 3)];
        assert_eq!(select_node(TaskType::SubdomainEnum, &candidates), Some(1));
    }

    #[test]
    fn none_when_no_node_qualifies() {
        let candidates = vec![load(0.0, 0.0, 4)];
        assert_eq!(select_node(TaskType::SubdomainEnum, &candidates), None);
        assert_eq!(select_node(TaskType::SubdomainEnum, &[]), None);
    }

    #[test]
    fn tie_break_prefers_recent_heartbeat() {
        let now = Utc::now();
        let mut older = load(10.0, 10.0, 0);
        older.last_heartbeat_at = Some(now - TimeDelta::seconds(120));
        let mut newer = load(10.0, 10.0, 0);
        newer.last_heartbeat_at = Some(now);
        let candidates = vec![older, newer];
        assert_eq!(select_node(TaskType::SubdomainEnum, &candidates), Some(1));
    }

    #[test]
    fn load_score_formula() {
        let n = load(60.0, 40.0, 2);
        // 0.5*60 + 0.3*40 + 0.2*(2/4)
        assert!((n.load_score() - (30.0 + 12.0 + 0.1)).abs() < 1e-9);
    }
}
