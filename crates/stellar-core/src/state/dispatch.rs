//! Semantic dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions, task submission, and dependency management.

use std::collections::{HashMap, HashSet};

use sqlx::PgPool;
use uuid::Uuid;

use stellar_db::models::{Task, TaskEventKind, TaskStatus};
use stellar_db::queries::tasks as db;
use stellar_db::queries::tasks::NewTask;

use super::TaskStateMachine;
use crate::error::{Error, Result};

/// Submit a new task with its dependency set.
///
/// Validates parameters, checks that every dependency exists, inserts the
/// task as `pending`, records the edges, and appends the `created` event.
pub async fn submit_task(pool: &PgPool, new: &NewTask, deps: &[Uuid]) -> Result<Task> {
    if new.name.trim().is_empty() {
        return Err(Error::Validation("task name must not be empty".into()));
    }
    if new.timeout_secs <= 0 {
        return Err(Error::Validation(format!(
            "task timeout must be positive, got {}",
            new.timeout_secs
        )));
    }
    if new.max_retries < 0 {
        return Err(Error::Validation(format!(
            "max_retries must be non-negative, got {}",
            new.max_retries
        )));
    }

    let mut seen = HashSet::new();
    for dep in deps {
        if !seen.insert(*dep) {
            continue;
        }
        if db::get_task(pool, *dep)
            .await
            .map_err(Error::Internal)?
            .is_none()
        {
            return Err(Error::Validation(format!(
                "dependency {dep} does not exist"
            )));
        }
    }

    let task = db::insert_task(pool, new).await.map_err(Error::Internal)?;

    for dep in &seen {
        db::insert_dependency(pool, task.id, *dep)
            .await
            .map_err(Error::Internal)?;
    }

    TaskStateMachine::append_event(
        pool,
        task.id,
        TaskEventKind::Created,
        TaskStatus::Pending,
        "task created",
        None,
    )
    .await?;

    Ok(task)
}

/// Add a dependency edge to an existing pending task, rejecting edges that
/// would close a cycle.
pub async fn add_dependency(pool: &PgPool, task_id: Uuid, dep_id: Uuid) -> Result<()> {
    if task_id == dep_id {
        return Err(Error::Validation("a task cannot depend on itself".into()));
    }

    let task = db::get_task(pool, task_id)
        .await
        .map_err(Error::Internal)?
        .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
    if task.status != TaskStatus::Pending {
        return Err(Error::Conflict(format!(
            "dependencies can only be added while pending; task {task_id} is {}",
            task.status
        )));
    }

    if db::get_task(pool, dep_id)
        .await
        .map_err(Error::Internal)?
        .is_none()
    {
        return Err(Error::Validation(format!("dependency {dep_id} does not exist")));
    }

    // Walk the graph from the proposed dependency: if the dependent task is
    // reachable, the new edge would close a cycle.
    let edges = db::edges_reachable_from(pool, &[dep_id])
        .await
        .map_err(Error::Internal)?;
    if detect_cycle_with_edge(&edges, task_id, dep_id) {
        return Err(Error::Validation(format!(
            "dependency {dep_id} -> {task_id} would create a cycle"
        )));
    }

    db::insert_dependency(pool, task_id, dep_id)
        .await
        .map_err(Error::Internal)?;
    Ok(())
}

/// Whether adding the edge `task -> dep` to `edges` closes a cycle, i.e.
/// `task` is reachable from `dep` through existing edges.
pub fn detect_cycle_with_edge(edges: &[(Uuid, Uuid)], task: Uuid, dep: Uuid) -> bool {
    let mut adj: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (from, to) in edges {
        adj.entry(*from).or_default().push(*to);
    }

    let mut stack = vec![dep];
    let mut visited = HashSet::new();
    while let Some(n) = stack.pop() {
        if n == task {
            return true;
        }
        if !visited.insert(n) {
            continue;
        }
        if let Some(next) = adj.get(&n) {
            stack.extend(next.iter().copied());
        }
    }
    false
}

/// Promote a pending task whose dependencies are satisfied: `pending -> queued`.
pub async fn enqueue_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Pending,
        TaskStatus::Queued,
        "dependencies satisfied",
        None,
    )
    .await
}

/// Assign a queued task to a node: `queued -> assigned`.
pub async fn assign_task(pool: &PgPool, task_id: Uuid, node_id: Uuid) -> Result<()> {
    let rows = db::assign_to_node(pool, task_id, node_id)
        .await
        .map_err(Error::Internal)?;
    if rows == 0 {
        return Err(Error::Conflict(format!(
            "task {task_id} was not queued when assignment was attempted"
        )));
    }
    TaskStateMachine::append_event(
        pool,
        task_id,
        TaskEventKind::Assigned,
        TaskStatus::Assigned,
        "assigned to node",
        Some(node_id),
    )
    .await
}

/// Worker ack: `assigned -> running`. The reporting node must match the
/// assignment.
pub async fn start_task(pool: &PgPool, task_id: Uuid, node_id: Uuid) -> Result<()> {
    let rows = db::start_running(pool, task_id, node_id)
        .await
        .map_err(Error::Internal)?;
    if rows == 0 {
        return Err(Error::Conflict(format!(
            "task {task_id} is not assigned to node {node_id}"
        )));
    }
    TaskStateMachine::append_event(
        pool,
        task_id,
        TaskEventKind::Started,
        TaskStatus::Running,
        "worker acknowledged",
        Some(node_id),
    )
    .await
}

/// Record a progress report for a running task and append a `progress`
/// event. Reports against non-running tasks are a conflict.
pub async fn report_progress(
    pool: &PgPool,
    task_id: Uuid,
    progress: f64,
    node_id: Option<Uuid>,
) -> Result<()> {
    let rows = db::update_progress(pool, task_id, progress)
        .await
        .map_err(Error::Internal)?;
    if rows == 0 {
        return Err(Error::Conflict(format!(
            "task {task_id} is not running; progress report dropped"
        )));
    }
    TaskStateMachine::append_event(
        pool,
        task_id,
        TaskEventKind::Progress,
        TaskStatus::Running,
        &format!("progress {progress:.0}%"),
        node_id,
    )
    .await
}

/// Successful completion: `running -> completed`.
pub async fn complete_task(pool: &PgPool, task_id: Uuid, node_id: Option<Uuid>) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Running,
        TaskStatus::Completed,
        "completed",
        node_id,
    )
    .await
}

/// Worker-reported failure: `running -> failed` with the error recorded.
pub async fn fail_task(
    pool: &PgPool,
    task_id: Uuid,
    error: &str,
    node_id: Option<Uuid>,
) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Running,
        TaskStatus::Failed,
        error,
        node_id,
    )
    .await
}

/// Mark a pending task failed because one of its dependencies terminated
/// non-successfully.
pub async fn fail_for_dependency(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Pending,
        TaskStatus::Failed,
        "dependency failed",
        None,
    )
    .await
}

/// Wall-clock expiry: `running -> timeout`.
pub async fn timeout_task(pool: &PgPool, task_id: Uuid, node_id: Option<Uuid>) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskStatus::Running,
        TaskStatus::Timeout,
        "deadline exceeded",
        node_id,
    )
    .await
}

/// Retry re-queue out of `failed` or `timeout`: back to `pending` with
/// `retry_count` incremented.
pub async fn retry_task(pool: &PgPool, task_id: Uuid, from: TaskStatus, reason: &str) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, from, TaskStatus::Pending, reason, None).await
}

/// Cancel a task. Idempotent: canceling an already-terminal task succeeds
/// without effect.
///
/// `pending`/`queued` transition directly; for `assigned`/`running` the
/// cancellation is recorded immediately and the cancel flag is raised so
/// the owning node observes it on its next poll.
pub async fn cancel_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    let task = db::get_task(pool, task_id)
        .await
        .map_err(Error::Internal)?
        .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;

    match task.status {
        TaskStatus::Pending | TaskStatus::Queued => {
            TaskStateMachine::transition(
                pool,
                task_id,
                task.status,
                TaskStatus::Canceled,
                "canceled by request",
                None,
            )
            .await
        }
        TaskStatus::Assigned | TaskStatus::Running => {
            db::set_cancel_requested(pool, task_id)
                .await
                .map_err(Error::Internal)?;
            TaskStateMachine::transition(
                pool,
                task_id,
                task.status,
                TaskStatus::Canceled,
                "canceled by request; node notified best-effort",
                task.assigned_node,
            )
            .await
        }
        // Already terminal: cancellation is idempotent.
        TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::Timeout => {
            Ok(())
        }
    }
}
