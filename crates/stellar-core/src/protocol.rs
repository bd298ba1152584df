//! Wire DTOs for the node and worker protocols.
//!
//! All messages are JSON. Field names use camelCase on the wire to match
//! the worker implementations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stellar_db::models::{NodeConfigDecl, NodeRole, NodeStatus, TaskStatus, TaskType};

use crate::error::WorkerErrorClass;

// ---------------------------------------------------------------------------
// Node protocol
// ---------------------------------------------------------------------------

/// `POST /nodes/register` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    pub ip: String,
    pub port: i32,
    pub role: NodeRole,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: Option<NodeConfigDecl>,
}

/// `POST /nodes/register` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub node_id: Uuid,
    pub api_key: String,
    pub status: NodeStatus,
    pub message: String,
}

/// `POST /nodes/{id}/heartbeat` request body.
///
/// Timestamps must be strictly increasing per node; a heartbeat older than
/// the last accepted one is rejected with 409.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHeartbeat {
    pub node_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub status: NodeStatus,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    #[serde(default)]
    pub disk_mb: f64,
    #[serde(default)]
    pub load_average: [f64; 3],
    pub running_tasks: i32,
    pub queued_tasks: i32,
    #[serde(default)]
    pub network_in_kbps: f64,
    #[serde(default)]
    pub network_out_kbps: f64,
    #[serde(default)]
    pub uptime_secs: i64,
    #[serde(default)]
    pub version: Option<String>,
}

// ---------------------------------------------------------------------------
// Worker protocol
// ---------------------------------------------------------------------------

/// Task envelope returned from `GET /tasks/assigned`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub name: String,
    pub task_type: TaskType,
    pub priority: i32,
    pub project_id: Uuid,
    pub timeout_secs: i64,
    pub retry_count: i32,
    pub params: serde_json::Value,
}

/// `PUT /tasks/{id}/status` request body: ack, progress, or completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: TaskStatus,
    #[serde(default)]
    pub node_id: Option<Uuid>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub result_data: Option<serde_json::Value>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_class: Option<WorkerErrorClass>,
}

// ---------------------------------------------------------------------------
// Uniform result envelope
// ---------------------------------------------------------------------------

/// Terminal status carried by a result envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeStatus {
    Completed,
    Failed,
    Partial,
}

/// The uniform result envelope every task type reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: EnvelopeStatus,
    pub data: serde_json::Value,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Type-specific `data` payload for subdomain enumeration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubdomainEnumData {
    pub total_found: u64,
    pub resolved_count: u64,
    pub wildcard_count: u64,
    pub takeover_count: u64,
    pub method_stats: std::collections::HashMap<String, MethodStats>,
    pub results: Vec<SubdomainResultData>,
}

/// Per-method candidate/result counters in the enumeration summary.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodStats {
    pub candidates: u64,
    pub results: u64,
    pub failed: bool,
}

/// One enumerated subdomain as it appears inside the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubdomainResultData {
    pub subdomain: String,
    pub root_domain: String,
    pub ips: Vec<String>,
    pub cname: Option<String>,
    pub record_type: String,
    pub records: Vec<stellar_db::models::DnsRecordData>,
    pub is_wildcard: bool,
    pub is_resolved: bool,
    pub is_takeover: bool,
    pub takeover_kind: Option<String>,
    pub sources: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_request_wire_format() {
        let json = serde_json::json!({
            "name": "scanner-1",
            "ip": "10.0.0.5",
            "port": 8440,
            "role": "worker",
            "tags": ["dc-east"]
        });
        let req: RegisterRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.name, "scanner-1");
        assert_eq!(req.role, NodeRole::Worker);
        assert!(req.config.is_none());
    }

    #[test]
    fn heartbeat_defaults_optional_telemetry() {
        let json = serde_json::json!({
            "nodeId": "5f0c41e8-3b5c-4e2b-9d1a-111111111111",
            "timestamp": "2026-01-01T00:00:00Z",
            "status": "online",
            "cpuPercent": 12.5,
            "memoryMb": 2048.0,
            "runningTasks": 1,
            "queuedTasks": 0
        });
        let hb: NodeHeartbeat = serde_json::from_value(json).unwrap();
        assert_eq!(hb.disk_mb, 0.0);
        assert_eq!(hb.load_average, [0.0, 0.0, 0.0]);
        assert!(hb.version.is_none());
    }

    #[test]
    fn status_report_completion_roundtrip() {
        let report = StatusReport {
            status: TaskStatus::Failed,
            node_id: None,
            progress: None,
            result_data: Some(serde_json::json!({"totalFound": 0})),
            summary: Some("no results".into()),
            error: Some("connect timed out".into()),
            error_class: Some(WorkerErrorClass::Transient),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["errorClass"], "transient");
        let back: StatusReport = serde_json::from_value(json).unwrap();
        assert_eq!(back.error_class, Some(WorkerErrorClass::Transient));
    }
}
