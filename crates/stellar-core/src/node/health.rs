//! Node health scoring.

use stellar_db::models::{Node, NodeStatus};

/// Health score plus the human-readable issues that produced it.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct HealthReport {
    pub score: i64,
    pub issues: Vec<String>,
}

/// Score a node from its latest telemetry.
///
/// Baseline 100. CPU above 90% costs 30 points (15 above 70%); memory above
/// 90% of the declared maximum costs 30 (15 above 70%); running more tasks
/// than the declared concurrency costs 20. Any status other than `online`
/// scores zero.
pub fn health_report(node: &Node) -> HealthReport {
    if node.status != NodeStatus::Online {
        return HealthReport {
            score: 0,
            issues: vec![format!("node is {}", node.status)],
        };
    }

    let mut score: i64 = 100;
    let mut issues = Vec::new();

    let cpu = node.telemetry.cpu_percent;
    if cpu > 90.0 {
        score -= 30;
        issues.push(format!("cpu at {cpu:.0}%"));
    } else if cpu > 70.0 {
        score -= 15;
        issues.push(format!("cpu elevated at {cpu:.0}%"));
    }

    let max_mem = node.config.max_memory_mb as f64;
    if max_mem > 0.0 {
        let mem_pct = node.telemetry.memory_mb / max_mem * 100.0;
        if mem_pct > 90.0 {
            score -= 30;
            issues.push(format!("memory at {mem_pct:.0}% of declared max"));
        } else if mem_pct > 70.0 {
            score -= 15;
            issues.push(format!("memory elevated at {mem_pct:.0}% of declared max"));
        }
    }

    if node.telemetry.running_tasks > node.config.max_concurrent_tasks {
        score -= 20;
        issues.push(format!(
            "running {} tasks over the declared limit of {}",
            node.telemetry.running_tasks, node.config.max_concurrent_tasks
        ));
    }

    HealthReport { score, issues }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use sqlx::types::Json;
    use uuid::Uuid;

    use stellar_db::models::{NodeConfigDecl, NodeRole, NodeTaskStats, NodeTelemetry};

    use super::*;

    fn node_with(telemetry: NodeTelemetry, status: NodeStatus) -> Node {
        Node {
            id: Uuid::new_v4(),
            name: "n".into(),
            address: "10.0.0.1".into(),
            port: 8440,
            role: NodeRole::Worker,
            status,
            tags: vec![],
            config: Json(NodeConfigDecl {
                max_concurrent_tasks: 4,
                max_memory_mb: 1000,
                ..NodeConfigDecl::default()
            }),
            telemetry: Json(telemetry),
            task_stats: Json(NodeTaskStats::default()),
            api_secret: "s".into(),
            version: None,
            registered_at: Utc::now(),
            last_heartbeat_at: Some(Utc::now()),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn idle_online_node_scores_full() {
        let report = health_report(&node_with(NodeTelemetry::default(), NodeStatus::Online));
        assert_eq!(report.score, 100);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn offline_node_scores_zero() {
        let report = health_report(&node_with(NodeTelemetry::default(), NodeStatus::Offline));
        assert_eq!(report.score, 0);
        assert_eq!(report.issues.len(), 1);
    }

    #[test]
    fn high_cpu_costs_thirty() {
        let telemetry = NodeTelemetry {
            cpu_percent: 95.0,
            ..NodeTelemetry::default()
        };
        let report = health_report(&node_with(telemetry, NodeStatus::Online));
        assert_eq!(report.score, 70);
    }

    #[test]
    fn elevated_cpu_costs_fifteen() {
        let telemetry = NodeTelemetry {
            cpu_percent: 75.0,
            ..NodeTelemetry::default()
        };
        let report = health_report(&node_with(telemetry, NodeStatus::Online));
        assert_eq!(report.score, 85);
    }

    #[test]
    fn all_penalties_stack() {
        let telemetry = NodeTelemetry {
            cpu_percent: 99.0,
            memory_mb: 950.0, // 95% of 1000
            running_tasks: 5, // over the limit of 4
            ..NodeTelemetry::default()
        };
        let report = health_report(&node_with(telemetry, NodeStatus::Online));
        assert_eq!(report.score, 100 - 30 - 30 - 20);
        assert_eq!(report.issues.len(), 3);
    }

    #[test]
    fn memory_penalty_uses_declared_max() {
        let telemetry = NodeTelemetry {
            memory_mb: 750.0, // 75% of 1000
            ..NodeTelemetry::default()
        };
        let report = health_report(&node_with(telemetry, NodeStatus::Online));
        assert_eq!(report.score, 85);
    }
}
