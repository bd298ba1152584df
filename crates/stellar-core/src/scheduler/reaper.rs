//! The timeout reaper coordinator.
//!
//! Scans running tasks once per second; any task past its wall-clock
//! deadline (`started_at + timeout_secs`) transitions to `timeout`, its
//! node is signalled to cancel, and the retry budget is applied as for a
//! failure.

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use stellar_db::models::TaskStatus;
use stellar_db::queries::tasks as task_db;

use crate::error::Error;
use crate::state::dispatch;

use super::Scheduler;

/// Run the reaper loop until cancellation.
pub async fn run_reaper_loop(scheduler: Scheduler, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(scheduler.config().reaper_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!("timeout reaper started");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                if let Err(e) = reap_once(scheduler.pool()).await {
                    tracing::error!(error = %e, "reaper pass failed");
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("timeout reaper stopped");
                return;
            }
        }
    }
}

/// One reaper pass. Returns the number of tasks timed out.
pub async fn reap_once(pool: &PgPool) -> anyhow::Result<u64> {
    let expired = task_db::running_past_deadline(pool).await?;
    let mut reaped = 0u64;

    for task in expired {
        // Raise the cancel flag first so the worker's next poll aborts the
        // attempt even if the transition below races with its report.
        task_db::set_cancel_requested(pool, task.id).await?;

        match dispatch::timeout_task(pool, task.id, task.assigned_node).await {
            Ok(()) => {
                reaped += 1;
                tracing::warn!(
                    task_id = %task.id,
                    name = %task.name,
                    timeout_secs = task.timeout_secs,
                    "task timed out"
                );
            }
            Err(Error::Conflict(_)) => continue, // worker report won the race
            Err(e) => return Err(e.into()),
        }

        // Timeout consumes retry budget exactly like a failure.
        if task.retry_count < task.max_retries {
            match dispatch::retry_task(pool, task.id, TaskStatus::Timeout, "retrying after timeout")
                .await
            {
                Ok(()) => {
                    tracing::info!(task_id = %task.id, "timed-out task re-queued");
                }
                Err(Error::Conflict(_)) | Err(Error::Permanent(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(reaped)
}
