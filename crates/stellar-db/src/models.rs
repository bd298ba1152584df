use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a node in the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Registering,
    Online,
    Offline,
    Disabled,
    Maintenance,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Registering => "registering",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Disabled => "disabled",
            Self::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeStatus {
    type Err = NodeStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registering" => Ok(Self::Registering),
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "disabled" => Ok(Self::Disabled),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(NodeStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeStatus`] string.
#[derive(Debug, Clone)]
pub struct NodeStatusParseError(pub String);

impl fmt::Display for NodeStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node status: {:?}", self.0)
    }
}

impl std::error::Error for NodeStatusParseError {}

// ---------------------------------------------------------------------------

/// Role a node plays in the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Controller,
    Worker,
    Hybrid,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Controller => "controller",
            Self::Worker => "worker",
            Self::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeRole {
    type Err = NodeRoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(Self::Controller),
            "worker" => Ok(Self::Worker),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(NodeRoleParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeRole`] string.
#[derive(Debug, Clone)]
pub struct NodeRoleParseError(pub String);

impl fmt::Display for NodeRoleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node role: {:?}", self.0)
    }
}

impl std::error::Error for NodeRoleParseError {}

// ---------------------------------------------------------------------------

/// Status of a scan task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Canceled,
    Timeout,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions except an
    /// explicit retry re-queue).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::Timeout
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "timeout" => Ok(Self::Timeout),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of scan a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    SubdomainEnum,
    PortScan,
    VulnScan,
    AssetDiscovery,
    PageMonitoring,
    SensitiveDetection,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SubdomainEnum => "subdomain_enum",
            Self::PortScan => "port_scan",
            Self::VulnScan => "vuln_scan",
            Self::AssetDiscovery => "asset_discovery",
            Self::PageMonitoring => "page_monitoring",
            Self::SensitiveDetection => "sensitive_detection",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = TaskTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subdomain_enum" => Ok(Self::SubdomainEnum),
            "port_scan" => Ok(Self::PortScan),
            "vuln_scan" => Ok(Self::VulnScan),
            "asset_discovery" => Ok(Self::AssetDiscovery),
            "page_monitoring" => Ok(Self::PageMonitoring),
            "sensitive_detection" => Ok(Self::SensitiveDetection),
            other => Err(TaskTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskType`] string.
#[derive(Debug, Clone)]
pub struct TaskTypeParseError(pub String);

impl fmt::Display for TaskTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task type: {:?}", self.0)
    }
}

impl std::error::Error for TaskTypeParseError {}

// ---------------------------------------------------------------------------

/// Task priority. Stored as an integer so the ready queue can order by it
/// directly (`ORDER BY priority DESC`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[repr(i32)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl TaskPriority {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = TaskPriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(TaskPriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskPriority`] string.
#[derive(Debug, Clone)]
pub struct TaskPriorityParseError(pub String);

impl fmt::Display for TaskPriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task priority: {:?}", self.0)
    }
}

impl std::error::Error for TaskPriorityParseError {}

// ---------------------------------------------------------------------------

/// Kind of entry in a task's append-only event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Created,
    Queued,
    Assigned,
    Started,
    Progress,
    Completed,
    Failed,
    Canceled,
    Timeout,
    Retry,
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Timeout => "timeout",
            Self::Retry => "retry",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskEventKind {
    type Err = TaskEventKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "started" => Ok(Self::Started),
            "progress" => Ok(Self::Progress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "timeout" => Ok(Self::Timeout),
            "retry" => Ok(Self::Retry),
            other => Err(TaskEventKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskEventKind`] string.
#[derive(Debug, Clone)]
pub struct TaskEventKindParseError(pub String);

impl fmt::Display for TaskEventKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task event kind: {:?}", self.0)
    }
}

impl std::error::Error for TaskEventKindParseError {}

// ---------------------------------------------------------------------------
// Nested JSON documents
// ---------------------------------------------------------------------------

/// Configuration a node declares at registration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfigDecl {
    pub max_concurrent_tasks: i32,
    pub max_memory_mb: i64,
    pub max_cpu_percent: f64,
    pub heartbeat_interval_secs: i64,
    pub task_timeout_secs: i64,
    pub enabled_task_types: Vec<TaskType>,
}

impl Default for NodeConfigDecl {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            max_memory_mb: 4096,
            max_cpu_percent: 90.0,
            heartbeat_interval_secs: 30,
            task_timeout_secs: 3600,
            enabled_task_types: vec![TaskType::SubdomainEnum],
        }
    }
}

/// Runtime telemetry a node reports with each heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeTelemetry {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
    pub load_average: [f64; 3],
    pub running_tasks: i32,
    pub queued_tasks: i32,
    pub network_in_kbps: f64,
    pub network_out_kbps: f64,
    pub uptime_secs: i64,
    /// Timestamp the node stamped on the heartbeat carrying this telemetry.
    pub reported_at: Option<DateTime<Utc>>,
}

/// Aggregate task statistics for a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeTaskStats {
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub per_type: HashMap<String, i64>,
    pub avg_execution_ms: f64,
    pub last_task_at: Option<DateTime<Utc>>,
}

/// A single DNS record observed for a subdomain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecordData {
    pub record_type: String,
    pub value: String,
    pub ttl: u32,
}

/// One entry in an asset's bounded change history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetChange {
    pub changed_at: DateTime<Utc>,
    pub task_id: Uuid,
    pub ips: Vec<String>,
    pub cname: Option<String>,
    pub is_takeover: bool,
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A node -- one member of the scan fleet.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub address: String,
    pub port: i32,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub tags: Vec<String>,
    pub config: Json<NodeConfigDecl>,
    pub telemetry: Json<NodeTelemetry>,
    pub task_stats: Json<NodeTaskStats>,
    /// Bearer secret issued at registration; required on heartbeats.
    #[serde(skip_serializing, default)]
    pub api_secret: String,
    pub version: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A task -- the unit of work nodes consume.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub project_id: Uuid,
    pub created_by: Uuid,
    pub timeout_secs: i64,
    pub retry_count: i32,
    pub max_retries: i32,
    pub progress: f64,
    pub assigned_node: Option<Uuid>,
    pub reassignable: bool,
    /// Set when the API requested cancellation of an assigned/running task;
    /// workers observe it by polling the task.
    pub cancel_requested: bool,
    pub tags: Vec<String>,
    pub error: Option<String>,
    pub params: Json<serde_json::Value>,
    pub callback_url: Option<String>,
    pub result_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An edge in the task dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

/// The stored terminal result of a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub data: Json<serde_json::Value>,
    pub summary: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One entry in a task's append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: Uuid,
    pub kind: TaskEventKind,
    pub status: TaskStatus,
    pub message: String,
    pub node_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A persisted subdomain enumeration result.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubdomainResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub subdomain: String,
    pub root_domain: String,
    pub ips: Vec<String>,
    pub cname: Option<String>,
    pub record_type: String,
    pub records: Json<Vec<DnsRecordData>>,
    pub is_wildcard: bool,
    pub is_resolved: bool,
    pub is_takeover: bool,
    pub takeover_kind: Option<String>,
    pub sources: Vec<String>,
    pub asset_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A derived asset: a live host discovered by enumeration, deduplicated per
/// project.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SubdomainAsset {
    pub id: Uuid,
    pub project_id: Uuid,
    pub host: String,
    pub root_domain: String,
    pub ips: Vec<String>,
    pub cname: Option<String>,
    pub is_takeover: bool,
    pub source_task_id: Uuid,
    pub tags: Vec<String>,
    pub change_history: Json<Vec<AssetChange>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A take-over fingerprint rule. Rules are matched in `position` order;
/// first match wins.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TakeoverRule {
    pub id: Uuid,
    pub service: String,
    pub cname_pattern: String,
    pub body_pattern: Option<String>,
    pub position: i32,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
