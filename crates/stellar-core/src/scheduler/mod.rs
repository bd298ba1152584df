//! The task scheduler: queue pump, assignment, worker report handling,
//! node-loss recovery, and the timeout reaper.
//!
//! The pump is a single coordinator loop that re-evaluates on any of:
//! a submission/cancellation wake, a node state-change event, or a
//! fallback tick. The reaper is a second coordinator running at 1 Hz.

pub mod assign;
pub mod reaper;

pub use reaper::run_reaper_loop;

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stellar_db::models::{NodeStatus, Task, TaskStatus};
use stellar_db::queries::{nodes as node_db, tasks as task_db};
use stellar_db::queries::tasks::NewTask;

use crate::error::{Error, Result, WorkerErrorClass};
use crate::ingest;
use crate::node::{NodeEvent, NodeManager};
use crate::protocol::StatusReport;
use crate::state::dispatch;

use assign::{NodeLoad, select_node};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Fallback pump re-evaluation interval when no wake arrives.
    pub pump_interval: Duration,
    /// Timeout reaper cadence.
    pub reaper_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pump_interval: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(1),
        }
    }
}

/// The scheduler. Cheap to clone; clones share the wake handle.
#[derive(Clone)]
pub struct Scheduler {
    pool: PgPool,
    nodes: NodeManager,
    config: SchedulerConfig,
    wake: Arc<Notify>,
}

impl Scheduler {
    pub fn new(pool: PgPool, nodes: NodeManager, config: SchedulerConfig) -> Self {
        Self {
            pool,
            nodes,
            config,
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Submit a new task. Returns the stored record in `pending` status;
    /// the pump promotes and assigns it asynchronously.
    pub async fn submit(&self, new: &NewTask, deps: &[Uuid]) -> Result<Task> {
        let task = dispatch::submit_task(&self.pool, new, deps).await?;
        self.wake.notify_one();
        Ok(task)
    }

    /// Cancel a task (idempotent; see [`dispatch::cancel_task`]).
    pub async fn cancel(&self, task_id: Uuid) -> Result<()> {
        dispatch::cancel_task(&self.pool, task_id).await?;
        self.wake.notify_one();
        Ok(())
    }

    /// Operator retry of a terminally failed or timed-out task.
    pub async fn retry(&self, task_id: Uuid) -> Result<()> {
        let task = task_db::get_task(&self.pool, task_id)
            .await
            .map_err(Error::Internal)?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        match task.status {
            TaskStatus::Failed | TaskStatus::Timeout => {
                dispatch::retry_task(&self.pool, task_id, task.status, "operator retry").await?;
                self.wake.notify_one();
                Ok(())
            }
            other => Err(Error::Conflict(format!(
                "task {task_id} is {other}; only failed or timed-out tasks can be retried"
            ))),
        }
    }

    /// Handle a worker's `PUT /tasks/{id}/status` report.
    ///
    /// `running` with a node id acks the assignment (or updates progress on
    /// later reports); `completed`/`failed` terminate the attempt, persist
    /// the result, and apply retry classification.
    pub async fn handle_status_report(&self, task_id: Uuid, report: &StatusReport) -> Result<()> {
        let task = task_db::get_task(&self.pool, task_id)
            .await
            .map_err(Error::Internal)?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;

        match report.status {
            TaskStatus::Running => {
                if task.status == TaskStatus::Assigned {
                    let node_id = report.node_id.or(task.assigned_node).ok_or_else(|| {
                        Error::Validation("running ack requires a node id".into())
                    })?;
                    dispatch::start_task(&self.pool, task_id, node_id).await?;
                }
                if let Some(progress) = report.progress {
                    dispatch::report_progress(&self.pool, task_id, progress, task.assigned_node)
                        .await?;
                }
                Ok(())
            }
            TaskStatus::Completed => {
                self.finish_task(&task, report, true).await?;
                self.wake.notify_one();
                Ok(())
            }
            TaskStatus::Failed => {
                self.finish_task(&task, report, false).await?;
                self.wake.notify_one();
                Ok(())
            }
            other => Err(Error::Validation(format!(
                "workers may only report running, completed, or failed; got {other}"
            ))),
        }
    }

    /// Terminate an attempt from a worker report: transition, persist the
    /// result envelope, record node stats, and apply retry classification.
    async fn finish_task(&self, task: &Task, report: &StatusReport, success: bool) -> Result<()> {
        let node_id = task.assigned_node;

        if success {
            dispatch::complete_task(&self.pool, task.id, node_id).await?;
        } else {
            let error = report.error.as_deref().unwrap_or("worker reported failure");
            dispatch::fail_task(&self.pool, task.id, error, node_id).await?;
        }

        ingest::store_report(&self.pool, task, report, success).await?;

        if let Some(node_id) = node_id {
            let execution_ms = task
                .started_at
                .map(|s| (chrono::Utc::now() - s).num_milliseconds() as f64)
                .unwrap_or(0.0);
            if let Err(e) = self
                .nodes
                .record_task_outcome(node_id, &task.task_type.to_string(), success, execution_ms)
                .await
            {
                tracing::warn!(node_id = %node_id, error = %e, "failed to record node task stats");
            }
        }

        if !success {
            let class = report.error_class.unwrap_or(WorkerErrorClass::Permanent);
            if class.is_retryable() && task.retry_count < task.max_retries {
                dispatch::retry_task(
                    &self.pool,
                    task.id,
                    TaskStatus::Failed,
                    &format!("retrying after {class} error"),
                )
                .await?;
            }
        }

        Ok(())
    }

    /// Run the queue pump until cancellation.
    pub async fn run_pump(&self, cancel: CancellationToken) {
        let mut node_events = self.nodes.subscribe();
        tracing::info!("scheduler pump started");

        loop {
            if let Err(e) = self.pump_once().await {
                tracing::error!(error = %e, "scheduler pump pass failed");
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                event = node_events.recv() => {
                    match event {
                        Ok(NodeEvent::Offline(node_id)) => {
                            if let Err(e) = self.handle_node_loss(node_id).await {
                                tracing::error!(node_id = %node_id, error = %e, "node-loss recovery failed");
                            }
                        }
                        Ok(NodeEvent::Online(_)) => {
                            // New capacity: fall through to re-evaluate.
                        }
                        Err(_) => {
                            // Lagged or closed; re-evaluate regardless.
                        }
                    }
                }
                _ = tokio::time::sleep(self.config.pump_interval) => {}
                _ = cancel.cancelled() => {
                    tracing::info!("scheduler pump stopped");
                    return;
                }
            }
        }
    }

    /// One pump pass: cascade dependency failures, promote ready tasks,
    /// then assign the queue.
    pub async fn pump_once(&self) -> Result<()> {
        self.cascade_failed_dependencies().await?;
        self.promote_ready().await?;
        self.assign_queued().await?;
        Ok(())
    }

    /// Fail pending tasks whose dependencies terminated non-successfully.
    async fn cascade_failed_dependencies(&self) -> Result<()> {
        let doomed = task_db::pending_with_failed_deps(&self.pool)
            .await
            .map_err(Error::Internal)?;
        for task in doomed {
            match dispatch::fail_for_dependency(&self.pool, task.id).await {
                Ok(()) => {
                    tracing::info!(task_id = %task.id, name = %task.name, "dependency failed; task failed");
                }
                Err(Error::Conflict(_)) => {} // racing writer moved it first
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Promote pending tasks whose dependency sets are fully completed.
    async fn promote_ready(&self) -> Result<()> {
        let ready = task_db::ready_pending_tasks(&self.pool)
            .await
            .map_err(Error::Internal)?;
        for task in ready {
            match dispatch::enqueue_task(&self.pool, task.id).await {
                Ok(()) => {
                    tracing::debug!(task_id = %task.id, name = %task.name, "task queued");
                }
                Err(Error::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Walk the ready queue in priority order and assign each task to the
    /// best qualifying node. Tasks with no qualifying node stay queued.
    async fn assign_queued(&self) -> Result<()> {
        let queued = task_db::queued_tasks_ordered(&self.pool)
            .await
            .map_err(Error::Internal)?;
        if queued.is_empty() {
            return Ok(());
        }

        let online = node_db::list_by_status(&self.pool, NodeStatus::Online)
            .await
            .map_err(Error::Internal)?;

        let mut loads: Vec<NodeLoad> = Vec::with_capacity(online.len());
        for node in &online {
            let count = task_db::count_tasks_on_node(&self.pool, node.id)
                .await
                .map_err(Error::Internal)?;
            if let Some(load) = NodeLoad::from_node(node, count) {
                loads.push(load);
            }
        }

        for task in queued {
            let Some(i) = select_node(task.task_type, &loads) else {
                continue;
            };
            let node_id = loads[i].id;
            match dispatch::assign_task(&self.pool, task.id, node_id).await {
                Ok(()) => {
                    loads[i].committed += 1;
                    tracing::info!(
                        task_id = %task.id,
                        name = %task.name,
                        node_id = %node_id,
                        "task assigned"
                    );
                }
                Err(Error::Conflict(_)) => {} // canceled or raced; skip
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Recover tasks owned by a node that went offline: re-queue each with
    /// retry budget (and `reassignable`), otherwise fail it.
    pub async fn handle_node_loss(&self, node_id: Uuid) -> Result<()> {
        let owned = task_db::tasks_on_node(&self.pool, node_id)
            .await
            .map_err(Error::Internal)?;

        for task in owned {
            let can_retry = task.reassignable && task.retry_count < task.max_retries;
            let outcome = if can_retry {
                dispatch::retry_task(&self.pool, task.id, task.status, "node lost; re-queued")
                    .await
            } else {
                crate::state::TaskStateMachine::transition(
                    &self.pool,
                    task.id,
                    task.status,
                    TaskStatus::Failed,
                    "node lost",
                    Some(node_id),
                )
                .await
            };

            match outcome {
                Ok(()) => {
                    tracing::warn!(
                        task_id = %task.id,
                        node_id = %node_id,
                        requeued = can_retry,
                        "recovered task from lost node"
                    );
                }
                Err(Error::Conflict(_)) => {} // the worker raced in a final report
                Err(e) => return Err(e),
            }
        }

        self.wake.notify_one();
        Ok(())
    }
}
