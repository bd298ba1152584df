//! Integration tests for the scheduler: promotion, assignment, node loss,
//! dependency cascade, timeout reaping, cancellation, and concurrent
//! worker reports.
//!
//! These tests use the shared PostgreSQL container from stellar-test-utils.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use stellar_core::error::{Error, WorkerErrorClass};
use stellar_core::node::{NodeEvent, NodeManager, NodeManagerConfig, liveness};
use stellar_core::protocol::{NodeHeartbeat, RegisterRequest, StatusReport};
use stellar_core::scheduler::reaper;
use stellar_core::scheduler::{Scheduler, SchedulerConfig};
use stellar_core::state::dispatch;
use stellar_db::models::{
    NodeConfigDecl, NodeRole, NodeStatus, TaskEventKind, TaskStatus, TaskType,
};
use stellar_db::queries::{task_events, tasks as task_db};
use stellar_db::queries::tasks::NewTask;
use stellar_test_utils::TestDb;
use stellar_test_utils::fixtures::subdomain_task;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn manager(pool: &PgPool) -> NodeManager {
    NodeManager::new(pool.clone(), NodeManagerConfig::default())
}

fn scheduler(pool: &PgPool, nodes: &NodeManager) -> Scheduler {
    Scheduler::new(pool.clone(), nodes.clone(), SchedulerConfig::default())
}

/// Register a worker and heartbeat it online. Returns its id.
async fn online_worker(nodes: &NodeManager, name: &str) -> Uuid {
    let response = nodes
        .register(&RegisterRequest {
            name: name.into(),
            ip: "10.1.0.1".into(),
            port: 8441,
            role: NodeRole::Worker,
            tags: vec![],
            config: Some(NodeConfigDecl {
                max_concurrent_tasks: 4,
                heartbeat_interval_secs: 30,
                enabled_task_types: vec![TaskType::SubdomainEnum, TaskType::PortScan],
                ..NodeConfigDecl::default()
            }),
        })
        .await
        .expect("registration should succeed");

    let node = nodes
        .authenticate(response.node_id, &response.api_key)
        .await
        .expect("freshly issued key should authenticate");
    nodes
        .heartbeat(&node, &heartbeat(response.node_id))
        .await
        .expect("first heartbeat should be accepted");

    response.node_id
}

fn heartbeat(node_id: Uuid) -> NodeHeartbeat {
    NodeHeartbeat {
        node_id,
        timestamp: Utc::now(),
        status: NodeStatus::Online,
        cpu_percent: 5.0,
        memory_mb: 256.0,
        disk_mb: 0.0,
        load_average: [0.0, 0.0, 0.0],
        running_tasks: 0,
        queued_tasks: 0,
        network_in_kbps: 0.0,
        network_out_kbps: 0.0,
        uptime_secs: 60,
        version: None,
    }
}

async fn status_of(pool: &PgPool, id: Uuid) -> TaskStatus {
    task_db::get_task(pool, id).await.unwrap().unwrap().status
}

async fn event_kinds(pool: &PgPool, id: Uuid) -> Vec<TaskEventKind> {
    task_events::list_events_for_task(pool, id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.kind)
        .collect()
}

fn running_report(node_id: Uuid) -> StatusReport {
    StatusReport {
        status: TaskStatus::Running,
        node_id: Some(node_id),
        progress: None,
        result_data: None,
        summary: None,
        error: None,
        error_class: None,
    }
}

// ---------------------------------------------------------------------------
// Promotion and assignment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_promote_assign_flow() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);
    let node_id = online_worker(&nodes, "w1").await;

    let task = sched.submit(&subdomain_task("t"), &[]).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    sched.pump_once().await.unwrap();

    let stored = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Assigned);
    assert_eq!(stored.assigned_node, Some(node_id));

    assert_eq!(
        event_kinds(&pool, task.id).await,
        vec![
            TaskEventKind::Created,
            TaskEventKind::Queued,
            TaskEventKind::Assigned
        ]
    );

    db.teardown().await;
}

#[tokio::test]
async fn task_stays_queued_without_capable_node() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);
    // The only node enables subdomain/port scans, not vuln scans.
    online_worker(&nodes, "w1").await;

    let task = sched
        .submit(
            &NewTask::new("vuln", TaskType::VulnScan, Uuid::new_v4()),
            &[],
        )
        .await
        .unwrap();
    sched.pump_once().await.unwrap();

    assert_eq!(status_of(&pool, task.id).await, TaskStatus::Queued);

    db.teardown().await;
}

#[tokio::test]
async fn priority_orders_assignment_under_scarce_capacity() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);

    // One node with a single slot.
    let response = nodes
        .register(&RegisterRequest {
            name: "tiny".into(),
            ip: "10.1.0.2".into(),
            port: 8441,
            role: NodeRole::Worker,
            tags: vec![],
            config: Some(NodeConfigDecl {
                max_concurrent_tasks: 1,
                enabled_task_types: vec![TaskType::SubdomainEnum],
                ..NodeConfigDecl::default()
            }),
        })
        .await
        .unwrap();
    let node = nodes
        .authenticate(response.node_id, &response.api_key)
        .await
        .unwrap();
    nodes.heartbeat(&node, &heartbeat(response.node_id)).await.unwrap();

    let low = sched.submit(&subdomain_task("low"), &[]).await.unwrap();
    let mut critical_new = subdomain_task("critical");
    critical_new.priority = stellar_db::models::TaskPriority::Critical;
    let critical = sched.submit(&critical_new, &[]).await.unwrap();

    sched.pump_once().await.unwrap();

    // The critical task takes the only slot even though it arrived later.
    assert_eq!(status_of(&pool, critical.id).await, TaskStatus::Assigned);
    assert_eq!(status_of(&pool, low.id).await, TaskStatus::Queued);

    db.teardown().await;
}

// ---------------------------------------------------------------------------
// Node loss (S3)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn node_loss_requeues_running_task_and_reassigns() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);
    let mut events = nodes.subscribe();

    let n1 = online_worker(&nodes, "n1").await;
    let task = sched.submit(&subdomain_task("t"), &[]).await.unwrap();
    sched.pump_once().await.unwrap();
    sched
        .handle_status_report(task.id, &running_report(n1))
        .await
        .unwrap();
    assert_eq!(status_of(&pool, task.id).await, TaskStatus::Running);

    // N1 stops heartbeating: age its heartbeat past 3x its interval and
    // run a liveness scan.
    sqlx::query("UPDATE nodes SET last_heartbeat_at = NOW() - interval '1 hour' WHERE id = $1")
        .bind(n1)
        .execute(&pool)
        .await
        .unwrap();
    liveness::scan_once(&pool, &nodes).await.unwrap();

    // The offline event is published for the scheduler.
    loop {
        match events.try_recv() {
            Ok(NodeEvent::Offline(id)) => {
                assert_eq!(id, n1);
                break;
            }
            Ok(_) => continue,
            Err(e) => panic!("expected offline event, got {e:?}"),
        }
    }
    sched.handle_node_loss(n1).await.unwrap();

    let stored = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.retry_count, 1);
    assert_eq!(stored.assigned_node, None);

    // A fresh node comes up; the next tick reassigns.
    let n2 = online_worker(&nodes, "n2").await;
    sched.pump_once().await.unwrap();

    let stored = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Assigned);
    assert_eq!(stored.assigned_node, Some(n2));

    assert_eq!(
        event_kinds(&pool, task.id).await,
        vec![
            TaskEventKind::Created,
            TaskEventKind::Queued,
            TaskEventKind::Assigned,
            TaskEventKind::Started,
            TaskEventKind::Retry,
            TaskEventKind::Queued,
            TaskEventKind::Assigned,
        ]
    );

    db.teardown().await;
}

#[tokio::test]
async fn node_loss_without_retries_fails_the_task() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);

    let n1 = online_worker(&nodes, "n1").await;
    let mut new = subdomain_task("no-retries");
    new.max_retries = 0;
    let task = sched.submit(&new, &[]).await.unwrap();
    sched.pump_once().await.unwrap();
    sched
        .handle_status_report(task.id, &running_report(n1))
        .await
        .unwrap();

    sched.handle_node_loss(n1).await.unwrap();

    let stored = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("node lost"));

    db.teardown().await;
}

// ---------------------------------------------------------------------------
// Dependencies (S4)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dependency_failure_cascades() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);
    let n1 = online_worker(&nodes, "n1").await;

    let mut a_new = subdomain_task("a");
    a_new.max_retries = 0;
    let a = sched.submit(&a_new, &[]).await.unwrap();
    let b = sched.submit(&subdomain_task("b"), &[a.id]).await.unwrap();

    // A runs and fails permanently.
    sched.pump_once().await.unwrap();
    sched
        .handle_status_report(a.id, &running_report(n1))
        .await
        .unwrap();
    sched
        .handle_status_report(
            a.id,
            &StatusReport {
                status: TaskStatus::Failed,
                node_id: Some(n1),
                progress: None,
                result_data: None,
                summary: None,
                error: Some("bad parameters".into()),
                error_class: Some(WorkerErrorClass::Permanent),
            },
        )
        .await
        .unwrap();
    assert_eq!(status_of(&pool, a.id).await, TaskStatus::Failed);

    // B was never queued and is failed by the cascade.
    sched.pump_once().await.unwrap();
    let stored_b = task_db::get_task(&pool, b.id).await.unwrap().unwrap();
    assert_eq!(stored_b.status, TaskStatus::Failed);
    assert_eq!(stored_b.error.as_deref(), Some("dependency failed"));

    let kinds = event_kinds(&pool, b.id).await;
    assert_eq!(kinds, vec![TaskEventKind::Created, TaskEventKind::Failed]);
    assert!(!kinds.contains(&TaskEventKind::Assigned));

    db.teardown().await;
}

#[tokio::test]
async fn dependent_task_waits_for_completion() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);
    let n1 = online_worker(&nodes, "n1").await;

    let a = sched.submit(&subdomain_task("a"), &[]).await.unwrap();
    let b = sched.submit(&subdomain_task("b"), &[a.id]).await.unwrap();

    sched.pump_once().await.unwrap();
    assert_eq!(status_of(&pool, a.id).await, TaskStatus::Assigned);
    assert_eq!(status_of(&pool, b.id).await, TaskStatus::Pending);

    sched
        .handle_status_report(a.id, &running_report(n1))
        .await
        .unwrap();
    sched
        .handle_status_report(
            a.id,
            &StatusReport {
                status: TaskStatus::Completed,
                node_id: Some(n1),
                progress: Some(100.0),
                result_data: None,
                summary: None,
                error: None,
                error_class: None,
            },
        )
        .await
        .unwrap();

    sched.pump_once().await.unwrap();
    assert_eq!(status_of(&pool, b.id).await, TaskStatus::Assigned);

    db.teardown().await;
}

#[tokio::test]
async fn missing_dependency_rejected_at_submission() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);

    let err = sched
        .submit(&subdomain_task("orphan"), &[Uuid::new_v4()])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    db.teardown().await;
}

// ---------------------------------------------------------------------------
// Timeout (S5)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reaper_times_out_and_requeues() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);
    let n1 = online_worker(&nodes, "n1").await;

    let mut new = subdomain_task("slow");
    new.timeout_secs = 1;
    let task = sched.submit(&new, &[]).await.unwrap();
    sched.pump_once().await.unwrap();
    sched
        .handle_status_report(task.id, &running_report(n1))
        .await
        .unwrap();

    // Age the start time past the deadline rather than sleeping.
    sqlx::query("UPDATE tasks SET started_at = NOW() - interval '10 seconds' WHERE id = $1")
        .bind(task.id)
        .execute(&pool)
        .await
        .unwrap();

    let reaped = reaper::reap_once(&pool).await.unwrap();
    assert_eq!(reaped, 1);

    let stored = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    // Retries remained, so the timeout was immediately re-queued.
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.retry_count, 1);

    let kinds = event_kinds(&pool, task.id).await;
    assert!(kinds.contains(&TaskEventKind::Timeout));
    assert_eq!(*kinds.last().unwrap(), TaskEventKind::Retry);

    db.teardown().await;
}

#[tokio::test]
async fn reaper_leaves_healthy_tasks_alone() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);
    let n1 = online_worker(&nodes, "n1").await;

    let task = sched.submit(&subdomain_task("fine"), &[]).await.unwrap();
    sched.pump_once().await.unwrap();
    sched
        .handle_status_report(task.id, &running_report(n1))
        .await
        .unwrap();

    let reaped = reaper::reap_once(&pool).await.unwrap();
    assert_eq!(reaped, 0);
    assert_eq!(status_of(&pool, task.id).await, TaskStatus::Running);

    db.teardown().await;
}

// ---------------------------------------------------------------------------
// Cancellation (property 7)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_before_assignment_yields_no_assigned_event() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);

    let pending = sched.submit(&subdomain_task("p"), &[]).await.unwrap();
    sched.cancel(pending.id).await.unwrap();
    assert_eq!(status_of(&pool, pending.id).await, TaskStatus::Canceled);

    // Queued variant: promote without assigning (no node online).
    let queued = sched.submit(&subdomain_task("q"), &[]).await.unwrap();
    sched.pump_once().await.unwrap();
    assert_eq!(status_of(&pool, queued.id).await, TaskStatus::Queued);
    sched.cancel(queued.id).await.unwrap();
    assert_eq!(status_of(&pool, queued.id).await, TaskStatus::Canceled);

    for id in [pending.id, queued.id] {
        let kinds = event_kinds(&pool, id).await;
        assert!(
            !kinds.contains(&TaskEventKind::Assigned),
            "canceled-before-assignment task must never see an assigned event"
        );
        assert!(kinds.contains(&TaskEventKind::Canceled));
    }

    // Idempotence.
    sched.cancel(pending.id).await.unwrap();

    db.teardown().await;
}

#[tokio::test]
async fn cancel_running_task_raises_node_signal() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);
    let n1 = online_worker(&nodes, "n1").await;

    let task = sched.submit(&subdomain_task("t"), &[]).await.unwrap();
    sched.pump_once().await.unwrap();
    sched
        .handle_status_report(task.id, &running_report(n1))
        .await
        .unwrap();

    sched.cancel(task.id).await.unwrap();

    let stored = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Canceled);
    assert!(stored.cancel_requested, "the node observes this flag by polling");

    db.teardown().await;
}

// ---------------------------------------------------------------------------
// Concurrent reports (S6) and retry budget (property 6)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_terminal_reports_resolve_to_one_winner() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);
    let n1 = online_worker(&nodes, "n1").await;

    let task = sched.submit(&subdomain_task("raced"), &[]).await.unwrap();
    sched.pump_once().await.unwrap();
    sched
        .handle_status_report(task.id, &running_report(n1))
        .await
        .unwrap();

    let complete = dispatch::complete_task(&pool, task.id, Some(n1)).await;
    let fail = dispatch::fail_task(&pool, task.id, "transient blip", Some(n1)).await;

    assert!(complete.is_ok());
    assert!(matches!(fail.unwrap_err(), Error::Conflict(_)));
    assert_eq!(status_of(&pool, task.id).await, TaskStatus::Completed);

    // Exactly one terminal event.
    let kinds = event_kinds(&pool, task.id).await;
    let terminal = kinds
        .iter()
        .filter(|k| {
            matches!(
                k,
                TaskEventKind::Completed
                    | TaskEventKind::Failed
                    | TaskEventKind::Canceled
                    | TaskEventKind::Timeout
            )
        })
        .count();
    assert_eq!(terminal, 1);

    db.teardown().await;
}

#[tokio::test]
async fn retry_budget_bounds_assignments() {
    let db = TestDb::create().await;
    let pool = db.pool().clone();
    let nodes = manager(&pool);
    let sched = scheduler(&pool, &nodes);
    let n1 = online_worker(&nodes, "n1").await;

    let mut new = subdomain_task("flaky");
    new.max_retries = 2;
    let task = sched.submit(&new, &[]).await.unwrap();

    // Fail with a retryable class until the budget is gone.
    for _ in 0..3 {
        sched.pump_once().await.unwrap();
        sched
            .handle_status_report(task.id, &running_report(n1))
            .await
            .unwrap();
        sched
            .handle_status_report(
                task.id,
                &StatusReport {
                    status: TaskStatus::Failed,
                    node_id: Some(n1),
                    progress: None,
                    result_data: None,
                    summary: None,
                    error: Some("connect timeout".into()),
                    error_class: Some(WorkerErrorClass::Transient),
                },
            )
            .await
            .unwrap();
    }

    let stored = task_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.retry_count, 2);

    // max_retries = 2 allows at most 3 assignments.
    let assigned = task_events::count_events_of_kind(&pool, task.id, TaskEventKind::Assigned)
        .await
        .unwrap();
    assert_eq!(assigned, 3);

    db.teardown().await;
}
