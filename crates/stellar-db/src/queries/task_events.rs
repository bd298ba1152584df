//! Database query functions for the `task_events` table.
//!
//! Events are append-only; the serial `id` column gives the authoritative
//! ordering per task.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{TaskEvent, TaskEventKind, TaskStatus};

/// Parameters for appending a task event.
#[derive(Debug, Clone)]
pub struct NewTaskEvent {
    pub task_id: Uuid,
    pub kind: TaskEventKind,
    pub status: TaskStatus,
    pub message: String,
    pub node_id: Option<Uuid>,
}

/// Append an event row. Returns the inserted row with server-generated
/// defaults (id, created_at).
pub async fn append_event(pool: &PgPool, new: &NewTaskEvent) -> Result<TaskEvent> {
    let event = sqlx::query_as::<_, TaskEvent>(
        "INSERT INTO task_events (task_id, kind, status, message, node_id) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.kind)
    .bind(new.status)
    .bind(&new.message)
    .bind(new.node_id)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to append {} event for task {}",
            new.kind, new.task_id
        )
    })?;

    Ok(event)
}

/// All events for a task in append order.
pub async fn list_events_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskEvent>> {
    let events = sqlx::query_as::<_, TaskEvent>(
        "SELECT * FROM task_events WHERE task_id = $1 ORDER BY id ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list events for task {task_id}"))?;

    Ok(events)
}

/// Count events of a given kind for a task.
pub async fn count_events_of_kind(
    pool: &PgPool,
    task_id: Uuid,
    kind: TaskEventKind,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM task_events WHERE task_id = $1 AND kind = $2",
    )
    .bind(task_id)
    .bind(kind)
    .fetch_one(pool)
    .await
    .context("failed to count task events")?;

    Ok(row.0)
}
