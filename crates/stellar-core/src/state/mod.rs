//! Task state machine transitions.
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph, optimistic locking, timestamp management,
//! the retry budget, and the append-only event log: every state change
//! writes exactly one `TaskEvent`.

pub mod dispatch;

use anyhow::Context;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use stellar_db::models::{TaskEventKind, TaskStatus};
use stellar_db::queries::task_events::{self, NewTaskEvent};
use stellar_db::queries::tasks as db;

use crate::error::{Error, Result};

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending  -> queued                    (dependencies completed)
/// pending  -> canceled | failed         (explicit cancel; dependency failed)
/// queued   -> assigned | canceled
/// assigned -> running | canceled
/// assigned -> pending | failed          (node lost: retry or budget spent)
/// running  -> completed | failed | canceled | timeout
/// running  -> pending                   (node lost: retry)
/// failed   -> pending                   (retry)
/// timeout  -> pending                   (retry)
/// ```
///
/// `completed`, `failed`, `canceled`, and `timeout` are terminal; the retry
/// re-queue out of `failed`/`timeout` is the only legal exit and is recorded
/// as a `retry` event.
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge
    /// in the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, Queued)
                | (Pending, Canceled)
                | (Pending, Failed)
                | (Queued, Assigned)
                | (Queued, Canceled)
                | (Assigned, Running)
                | (Assigned, Canceled)
                | (Assigned, Pending)
                | (Assigned, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Canceled)
                | (Running, Timeout)
                | (Running, Pending)
                | (Failed, Pending)
                | (Timeout, Pending)
        )
    }

    /// The event kind recorded for a transition.
    pub fn event_kind(from: TaskStatus, to: TaskStatus) -> TaskEventKind {
        match to {
            TaskStatus::Queued => TaskEventKind::Queued,
            TaskStatus::Assigned => TaskEventKind::Assigned,
            TaskStatus::Running => TaskEventKind::Started,
            TaskStatus::Completed => TaskEventKind::Completed,
            TaskStatus::Failed => TaskEventKind::Failed,
            TaskStatus::Canceled => TaskEventKind::Canceled,
            TaskStatus::Timeout => TaskEventKind::Timeout,
            // Any legal edge back to pending is a retry re-queue.
            TaskStatus::Pending => {
                debug_assert!(from != TaskStatus::Pending);
                TaskEventKind::Retry
            }
        }
    }

    /// Execute a state transition with optimistic locking and record the
    /// event.
    ///
    /// - Validates the transition is legal.
    /// - Sets `completed_at` when entering a terminal status.
    /// - For edges back to `pending` (retry / node-lost re-queue),
    ///   delegates to [`Self::retry_transition`] which also increments and
    ///   bounds the retry counter.
    ///
    /// Returns [`Error::Conflict`] if the stored status no longer matches
    /// `from`, and [`Error::NotFound`] if the task does not exist.
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        message: &str,
        node_id: Option<Uuid>,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            return Err(Error::Validation(format!(
                "invalid state transition: {from} -> {to} for task {task_id}"
            )));
        }

        if to == TaskStatus::Pending {
            return Self::retry_transition(pool, task_id, from, message).await;
        }

        let completed_at = if to.is_terminal() { Some(Utc::now()) } else { None };
        let error = if matches!(to, TaskStatus::Failed | TaskStatus::Timeout) && !message.is_empty()
        {
            Some(message)
        } else {
            None
        };

        let rows = db::transition_status(pool, task_id, from, to, None, completed_at, error)
            .await
            .map_err(Error::Internal)?;

        if rows == 0 {
            return Err(Self::precondition_failure(pool, task_id, from).await);
        }

        Self::append_event(pool, task_id, Self::event_kind(from, to), to, message, node_id)
            .await?;

        Ok(())
    }

    /// Handle an edge back to `pending`: increment the retry counter under
    /// its budget and clear assignment state, then record a `retry` event.
    async fn retry_transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        message: &str,
    ) -> Result<()> {
        let task = db::get_task(pool, task_id)
            .await
            .map_err(Error::Internal)?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;

        if task.status != from {
            return Err(Error::Conflict(format!(
                "task {task_id} has status {}, expected {from}",
                task.status
            )));
        }

        if task.retry_count >= task.max_retries {
            return Err(Error::Permanent(format!(
                "task {task_id} exhausted its retry budget ({}/{})",
                task.retry_count, task.max_retries
            )));
        }

        let rows = db::requeue_for_retry(pool, task_id, from, task.retry_count)
            .await
            .map_err(Error::Internal)?;

        if rows == 0 {
            return Err(Error::Conflict(format!(
                "concurrent update lost the retry race for task {task_id}"
            )));
        }

        Self::append_event(
            pool,
            task_id,
            TaskEventKind::Retry,
            TaskStatus::Pending,
            message,
            task.assigned_node,
        )
        .await?;

        Ok(())
    }

    /// Append one event row for a transition that already applied.
    pub(crate) async fn append_event(
        pool: &PgPool,
        task_id: Uuid,
        kind: TaskEventKind,
        status: TaskStatus,
        message: &str,
        node_id: Option<Uuid>,
    ) -> Result<()> {
        task_events::append_event(
            pool,
            &NewTaskEvent {
                task_id,
                kind,
                status,
                message: message.to_owned(),
                node_id,
            },
        )
        .await
        .context("failed to append task event")
        .map_err(Error::Internal)?;
        Ok(())
    }

    /// Build the error for a 0-row conditional update: distinguishes a
    /// missing task from a stale precondition.
    async fn precondition_failure(pool: &PgPool, task_id: Uuid, expected: TaskStatus) -> Error {
        match db::get_task(pool, task_id).await {
            Ok(None) => Error::NotFound(format!("task {task_id}")),
            Ok(Some(t)) => Error::Conflict(format!(
                "task {task_id} has status {}, expected {expected}",
                t.status
            )),
            Err(e) => Error::Internal(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use TaskStatus::*;

    #[test]
    fn forward_path_is_legal() {
        assert!(TaskStateMachine::is_valid_transition(Pending, Queued));
        assert!(TaskStateMachine::is_valid_transition(Queued, Assigned));
        assert!(TaskStateMachine::is_valid_transition(Assigned, Running));
        assert!(TaskStateMachine::is_valid_transition(Running, Completed));
    }

    #[test]
    fn cancellation_edges() {
        assert!(TaskStateMachine::is_valid_transition(Pending, Canceled));
        assert!(TaskStateMachine::is_valid_transition(Queued, Canceled));
        assert!(TaskStateMachine::is_valid_transition(Assigned, Canceled));
        assert!(TaskStateMachine::is_valid_transition(Running, Canceled));
    }

    #[test]
    fn retry_edges() {
        assert!(TaskStateMachine::is_valid_transition(Failed, Pending));
        assert!(TaskStateMachine::is_valid_transition(Timeout, Pending));
        assert!(TaskStateMachine::is_valid_transition(Assigned, Pending));
        assert!(TaskStateMachine::is_valid_transition(Running, Pending));
    }

    #[test]
    fn terminal_states_are_sticky() {
        assert!(!TaskStateMachine::is_valid_transition(Completed, Pending));
        assert!(!TaskStateMachine::is_valid_transition(Completed, Running));
        assert!(!TaskStateMachine::is_valid_transition(Canceled, Pending));
        assert!(!TaskStateMachine::is_valid_transition(Canceled, Queued));
        assert!(!TaskStateMachine::is_valid_transition(Failed, Running));
        assert!(!TaskStateMachine::is_valid_transition(Timeout, Running));
    }

    #[test]
    fn no_skipping_states() {
        assert!(!TaskStateMachine::is_valid_transition(Pending, Assigned));
        assert!(!TaskStateMachine::is_valid_transition(Pending, Running));
        assert!(!TaskStateMachine::is_valid_transition(Queued, Running));
        assert!(!TaskStateMachine::is_valid_transition(Queued, Completed));
        assert!(!TaskStateMachine::is_valid_transition(Assigned, Completed));
    }

    #[test]
    fn queued_cannot_timeout() {
        assert!(!TaskStateMachine::is_valid_transition(Queued, Timeout));
        assert!(!TaskStateMachine::is_valid_transition(Assigned, Timeout));
        assert!(!TaskStateMachine::is_valid_transition(Pending, Timeout));
    }

    #[test]
    fn event_kinds_match_targets() {
        assert_eq!(
            TaskStateMachine::event_kind(Pending, Queued),
            TaskEventKind::Queued
        );
        assert_eq!(
            TaskStateMachine::event_kind(Assigned, Running),
            TaskEventKind::Started
        );
        assert_eq!(
            TaskStateMachine::event_kind(Failed, Pending),
            TaskEventKind::Retry
        );
        assert_eq!(
            TaskStateMachine::event_kind(Running, Timeout),
            TaskEventKind::Timeout
        );
    }
}
