//! Database query functions for the `task_results` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{TaskResult, TaskStatus};

/// Parameters for inserting a new task result row.
#[derive(Debug, Clone)]
pub struct NewTaskResult {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub data: serde_json::Value,
    pub summary: String,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Insert a new task result row. Returns the inserted row with
/// server-generated defaults (id, created_at).
pub async fn insert_result(pool: &PgPool, new: &NewTaskResult) -> Result<TaskResult> {
    let result = sqlx::query_as::<_, TaskResult>(
        "INSERT INTO task_results (task_id, status, data, summary, error, completed_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.status)
    .bind(Json(&new.data))
    .bind(&new.summary)
    .bind(&new.error)
    .bind(new.completed_at)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert result for task {}", new.task_id))?;

    Ok(result)
}

/// Fetch a single result by ID.
pub async fn get_result(pool: &PgPool, id: Uuid) -> Result<Option<TaskResult>> {
    let result = sqlx::query_as::<_, TaskResult>("SELECT * FROM task_results WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task result")?;

    Ok(result)
}

