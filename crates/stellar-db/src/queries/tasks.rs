//! Database query functions for the `tasks` and `task_dependencies` tables.
//!
//! Every status mutation is conditional on the expected current status
//! (optimistic locking), so concurrent worker reports and scheduler loops
//! cannot produce lost updates: the row changes only if the precondition
//! still holds, and callers observe 0 affected rows otherwise.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{Task, TaskPriority, TaskStatus, TaskType};

/// Parameters for inserting a new task row.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub project_id: Uuid,
    pub created_by: Uuid,
    pub timeout_secs: i64,
    pub max_retries: i32,
    pub reassignable: bool,
    pub tags: Vec<String>,
    pub params: serde_json::Value,
    pub callback_url: Option<String>,
}

impl NewTask {
    /// A task with defaults suitable for most submissions.
    pub fn new(name: impl Into<String>, task_type: TaskType, project_id: Uuid) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            task_type,
            priority: TaskPriority::Normal,
            project_id,
            created_by: Uuid::nil(),
            timeout_secs: 3600,
            max_retries: 3,
            reassignable: true,
            tags: Vec::new(),
            params: serde_json::json!({}),
            callback_url: None,
        }
    }
}

/// Insert a new task row in `pending` status. Returns the inserted task with
/// server-generated defaults (id, created_at).
pub async fn insert_task(pool: &PgPool, new: &NewTask) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
         (name, description, task_type, priority, project_id, created_by, \
          timeout_secs, max_retries, reassignable, tags, params, callback_url) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         RETURNING *",
    )
    .bind(&new.name)
    .bind(&new.description)
    .bind(new.task_type)
    .bind(new.priority)
    .bind(new.project_id)
    .bind(new.created_by)
    .bind(new.timeout_secs)
    .bind(new.max_retries)
    .bind(new.reassignable)
    .bind(&new.tags)
    .bind(Json(&new.params))
    .bind(&new.callback_url)
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Filter for [`list_tasks`]. All fields are conjunctive; `None` matches all.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub project_id: Option<Uuid>,
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
}

/// List tasks matching a filter with pagination. Returns `(tasks, total)`.
pub async fn list_tasks(
    pool: &PgPool,
    filter: &TaskFilter,
    limit: i64,
    offset: i64,
) -> Result<(Vec<Task>, i64)> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE ($1::uuid IS NULL OR project_id = $1) \
           AND ($2::text IS NULL OR status = $2) \
           AND ($3::text IS NULL OR task_type = $3) \
         ORDER BY created_at DESC \
         LIMIT $4 OFFSET $5",
    )
    .bind(filter.project_id)
    .bind(filter.status)
    .bind(filter.task_type)
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    let total: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE ($1::uuid IS NULL OR project_id = $1) \
           AND ($2::text IS NULL OR status = $2) \
           AND ($3::text IS NULL OR task_type = $3)",
    )
    .bind(filter.project_id)
    .bind(filter.status)
    .bind(filter.task_type)
    .fetch_one(pool)
    .await
    .context("failed to count tasks")?;

    Ok((tasks, total.0))
}

// -----------------------------------------------------------------------
// Status transitions (optimistic locking)
// -----------------------------------------------------------------------

/// Atomically transition a task between statuses.
///
/// Sets `started_at`/`completed_at` when provided, records an error string
/// for failure transitions, and only applies when the current status equals
/// `from`. Returns the number of rows affected (0 = precondition failed).
pub async fn transition_status(
    pool: &PgPool,
    id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at), \
             error = COALESCE($4, error) \
         WHERE id = $5 AND status = $6",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(error)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Transition `queued -> assigned`, recording the chosen node.
pub async fn assign_to_node(pool: &PgPool, id: Uuid, node_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'assigned', assigned_node = $1 \
         WHERE id = $2 AND status = 'queued'",
    )
    .bind(node_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to assign task to node")?;

    Ok(result.rows_affected())
}

/// Transition `assigned -> running` as a worker ack. The node id must match
/// the assignment so a stale worker cannot start a reassigned task.
pub async fn start_running(pool: &PgPool, id: Uuid, node_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'running', started_at = NOW() \
         WHERE id = $1 AND status = 'assigned' AND assigned_node = $2",
    )
    .bind(id)
    .bind(node_id)
    .execute(pool)
    .await
    .context("failed to start task")?;

    Ok(result.rows_affected())
}

/// Update progress for a running task. Progress is clamped to [0, 100].
pub async fn update_progress(pool: &PgPool, id: Uuid, progress: f64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET progress = LEAST(GREATEST($1, 0), 100) \
         WHERE id = $2 AND status = 'running'",
    )
    .bind(progress)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update task progress")?;

    Ok(result.rows_affected())
}

/// Re-queue a task for retry: back to `pending` with `retry_count + 1`,
/// assignment and timing cleared. Conditional on both the expected current
/// status and the current retry count, and refuses to exceed the budget.
pub async fn requeue_for_retry(
    pool: &PgPool,
    id: Uuid,
    from: TaskStatus,
    current_retry: i32,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             retry_count = retry_count + 1, \
             assigned_node = NULL, \
             started_at = NULL, \
             completed_at = NULL, \
             progress = 0, \
             cancel_requested = FALSE \
         WHERE id = $1 AND status = $2 AND retry_count = $3 \
           AND retry_count < max_retries",
    )
    .bind(id)
    .bind(from)
    .bind(current_retry)
    .execute(pool)
    .await
    .context("failed to requeue task for retry")?;

    Ok(result.rows_affected())
}

/// Mark a task's cancel flag so workers polling the task observe the
/// cancellation request. Idempotent.
pub async fn set_cancel_requested(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET cancel_requested = TRUE WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set cancel flag")?;

    Ok(result.rows_affected())
}

/// Link a task to its stored result record.
pub async fn set_result_id(pool: &PgPool, id: Uuid, result_id: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET result_id = $1 WHERE id = $2")
        .bind(result_id)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set task result id")?;

    Ok(result.rows_affected())
}

// -----------------------------------------------------------------------
// Dependencies
// -----------------------------------------------------------------------

/// Insert a dependency edge: `task_id` depends on `depends_on_id`.
///
/// Uses `ON CONFLICT DO NOTHING` so this is idempotent.
pub async fn insert_dependency(pool: &PgPool, task_id: Uuid, depends_on_id: Uuid) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_dependencies (task_id, depends_on) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(depends_on_id)
    .execute(pool)
    .await
    .context("failed to insert task dependency")?;

    Ok(())
}

/// Get the IDs of all tasks that a given task depends on.
pub async fn get_dependencies(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to get task dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Dependencies of a task that are not yet `completed`.
pub async fn incomplete_dependencies(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "SELECT td.depends_on FROM task_dependencies td \
         JOIN tasks dep ON dep.id = td.depends_on \
         WHERE td.task_id = $1 AND dep.status != 'completed'",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to get incomplete dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// All dependency edges among the given task set plus edges from them to
/// any other task. Used by cycle detection at submission time.
pub async fn edges_reachable_from(pool: &PgPool, roots: &[Uuid]) -> Result<Vec<(Uuid, Uuid)>> {
    let rows: Vec<(Uuid, Uuid)> = sqlx::query_as(
        "WITH RECURSIVE reach AS ( \
             SELECT task_id, depends_on FROM task_dependencies WHERE task_id = ANY($1) \
             UNION \
             SELECT td.task_id, td.depends_on \
             FROM task_dependencies td \
             JOIN reach r ON td.task_id = r.depends_on \
         ) \
         SELECT task_id, depends_on FROM reach",
    )
    .bind(roots)
    .fetch_all(pool)
    .await
    .context("failed to query reachable dependency edges")?;

    Ok(rows)
}

// -----------------------------------------------------------------------
// Scheduler queries
// -----------------------------------------------------------------------

/// Pending tasks whose dependencies are all `completed` (ready to be
/// promoted to the queue).
pub async fn ready_pending_tasks(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         WHERE t.status = 'pending' \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id AND dep.status != 'completed' \
           )",
    )
    .fetch_all(pool)
    .await
    .context("failed to get ready pending tasks")?;

    Ok(tasks)
}

/// Pending tasks with at least one dependency in a terminal non-completed
/// status. These can never run and must be failed with a cascade reason.
pub async fn pending_with_failed_deps(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT DISTINCT t.* FROM tasks t \
         JOIN task_dependencies td ON td.task_id = t.id \
         JOIN tasks dep ON dep.id = td.depends_on \
         WHERE t.status = 'pending' \
           AND dep.status IN ('failed', 'canceled', 'timeout')",
    )
    .fetch_all(pool)
    .await
    .context("failed to get tasks with failed dependencies")?;

    Ok(tasks)
}

/// The ready queue: queued tasks in assignment order
/// (priority descending, then submission order).
pub async fn queued_tasks_ordered(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'queued' \
         ORDER BY priority DESC, created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to get queued tasks")?;

    Ok(tasks)
}

/// Tasks currently owned by a node (assigned or running). Used for
/// node-loss recovery.
pub async fn tasks_on_node(pool: &PgPool, node_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE assigned_node = $1 AND status IN ('assigned', 'running')",
    )
    .bind(node_id)
    .fetch_all(pool)
    .await
    .context("failed to get tasks on node")?;

    Ok(tasks)
}

/// Count of tasks currently owned by a node.
pub async fn count_tasks_on_node(pool: &PgPool, node_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE assigned_node = $1 AND status IN ('assigned', 'running')",
    )
    .bind(node_id)
    .fetch_one(pool)
    .await
    .context("failed to count tasks on node")?;

    Ok(row.0)
}

/// Running tasks whose wall-clock deadline (`started_at + timeout_secs`)
/// has passed. Consumed by the timeout reaper.
pub async fn running_past_deadline(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'running' \
           AND started_at IS NOT NULL \
           AND started_at + timeout_secs * interval '1 second' < NOW()",
    )
    .fetch_all(pool)
    .await
    .context("failed to get timed-out tasks")?;

    Ok(tasks)
}

/// The next task assigned to a node, optionally filtered to a type set.
/// Workers long-poll this to pull their work.
pub async fn assigned_task_for_node(
    pool: &PgPool,
    node_id: Uuid,
    types: &[TaskType],
) -> Result<Option<Task>> {
    let type_strs: Vec<String> = types.iter().map(|t| t.to_string()).collect();
    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE assigned_node = $1 AND status = 'assigned' \
           AND (cardinality($2::text[]) = 0 OR task_type = ANY($2)) \
         ORDER BY priority DESC, created_at ASC \
         LIMIT 1",
    )
    .bind(node_id)
    .bind(&type_strs)
    .fetch_optional(pool)
    .await
    .context("failed to fetch assigned task for node")?;

    Ok(task)
}
