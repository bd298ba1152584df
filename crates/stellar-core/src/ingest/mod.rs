//! Result ingestion: translates worker-reported result envelopes into
//! store writes, per task type.

pub mod subdomain;

use chrono::Utc;
use sqlx::PgPool;

use stellar_db::models::{Task, TaskResult, TaskStatus, TaskType};
use stellar_db::queries::task_results::{self, NewTaskResult};
use stellar_db::queries::tasks as task_db;

use crate::error::{Error, Result};
use crate::protocol::{EnvelopeStatus, ResultEnvelope, StatusReport, SubdomainEnumData};

/// Persist a terminal worker report: one `TaskResult` row linked from the
/// task, plus the type-specific record writes.
///
/// Ingestion is at-least-once from the reporting side; the type-specific
/// writers upsert on their dedup keys, so replays are harmless.
pub async fn store_report(
    pool: &PgPool,
    task: &Task,
    report: &StatusReport,
    success: bool,
) -> Result<()> {
    let status = if success {
        TaskStatus::Completed
    } else {
        TaskStatus::Failed
    };

    let data = report.result_data.clone().unwrap_or(serde_json::json!({}));
    let summary = report.summary.clone().unwrap_or_default();

    let result = task_results::insert_result(
        pool,
        &NewTaskResult {
            task_id: task.id,
            status,
            data: data.clone(),
            summary,
            error: report.error.clone(),
            completed_at: Some(Utc::now()),
        },
    )
    .await
    .map_err(Error::Internal)?;

    task_db::set_result_id(pool, task.id, result.id)
        .await
        .map_err(Error::Internal)?;

    if success && task.task_type == TaskType::SubdomainEnum && report.result_data.is_some() {
        match serde_json::from_value::<SubdomainEnumData>(data) {
            Ok(enum_data) => subdomain::ingest_envelope(pool, task, &enum_data).await?,
            Err(e) => {
                // A malformed payload should not lose the completion; the
                // raw envelope is already stored.
                tracing::warn!(
                    task_id = %task.id,
                    error = %e,
                    "could not decode subdomain result data; skipping record ingestion"
                );
            }
        }
    }

    if task.callback_url.is_some() {
        notify_callback(task, &result).await;
    }

    Ok(())
}

/// Best-effort delivery of the uniform result envelope to the task's
/// callback URL. Failures are logged, never surfaced: the result is
/// already persisted and the caller can poll.
async fn notify_callback(task: &Task, result: &TaskResult) {
    let Some(url) = &task.callback_url else { return };

    let envelope = ResultEnvelope {
        id: result.id,
        task_id: task.id,
        status: match result.status {
            TaskStatus::Completed => EnvelopeStatus::Completed,
            _ => EnvelopeStatus::Failed,
        },
        data: result.data.0.clone(),
        summary: result.summary.clone(),
        created_at: result.created_at,
        end_time: result.completed_at,
        error: result.error.clone(),
    };

    let client = reqwest::Client::new();
    match client.post(url).json(&envelope).send().await {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(task_id = %task.id, url = %url, "callback delivered");
        }
        Ok(response) => {
            tracing::warn!(
                task_id = %task.id,
                url = %url,
                status = %response.status(),
                "callback rejected"
            );
        }
        Err(e) => {
            tracing::warn!(task_id = %task.id, url = %url, error = %e, "callback delivery failed");
        }
    }
}
