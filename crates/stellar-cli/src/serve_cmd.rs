//! The controller: the node/worker protocol listener plus the three
//! coordinator loops (scheduler pump, timeout reaper, node liveness).

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use stellar_core::error::Error;
use stellar_core::node::{NodeManager, run_liveness_loop};
use stellar_core::protocol::{NodeHeartbeat, RegisterRequest, StatusReport, TaskEnvelope};
use stellar_core::scheduler::{Scheduler, run_reaper_loop};
use stellar_db::models::{Node, NodeConfigDecl, Task, TaskType};
use stellar_db::queries::tasks as task_db;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthorized",
            message: msg.into(),
        }
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Permanent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Internal(inner) => {
                tracing::error!(error = ?inner, "internal error");
                // Internal details are never leaked to callers.
                return Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: err.code(),
                    message: "internal error".to_owned(),
                };
            }
        };
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({
            "code": self.code,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub nodes: NodeManager,
    pub scheduler: Scheduler,
    /// Long-poll window for `GET /tasks/assigned`.
    pub pull_window: Duration,
    /// Poll interval within the window.
    pub pull_interval: Duration,
}

impl AppState {
    pub fn new(pool: PgPool, nodes: NodeManager, scheduler: Scheduler) -> Self {
        Self {
            pool,
            nodes,
            scheduler,
            pull_window: Duration::from_secs(25),
            pull_interval: Duration::from_millis(500),
        }
    }
}

/// Extract the bearer token from the Authorization header.
fn bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| AppError::unauthorized("missing bearer token"))
}

/// Authenticate a node-scoped request: the bearer token must be the secret
/// issued to `node_id` at registration.
async fn authenticate(
    state: &AppState,
    node_id: Uuid,
    headers: &HeaderMap,
) -> Result<Node, AppError> {
    let token = bearer_token(headers)?;
    state
        .nodes
        .authenticate(node_id, token)
        .await
        .map_err(|_| AppError::unauthorized("unknown node or invalid api key"))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/nodes/register", post(register))
        .route("/nodes/{id}/heartbeat", post(heartbeat))
        .route("/nodes/unregister/{id}", post(unregister))
        .route("/nodes/{id}/config", get(node_config))
        .route("/tasks/assigned", get(pull_assigned))
        .route("/tasks/{id}/status", put(report_status))
        .route("/tasks/{id}", get(get_task))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Errors from the serve command, separated so the binary can map them to
/// its exit codes.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Run the controller until ctrl-c. Returns `Ok(())` after a graceful
/// shutdown (the binary maps the interrupt to exit code 130 itself).
pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<(), ServeError> {
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .map_err(|e| ServeError::Other(anyhow::anyhow!("invalid bind address: {e}")))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind { addr, source })?;

    // Coordinator loops share one cancellation token with the listener.
    let cancel = CancellationToken::new();
    let mut coordinators = tokio::task::JoinSet::new();
    {
        let nodes = state.nodes.clone();
        let token = cancel.clone();
        coordinators.spawn(async move { run_liveness_loop(nodes, token).await });
    }
    {
        let scheduler = state.scheduler.clone();
        let token = cancel.clone();
        coordinators.spawn(async move { scheduler.run_pump(token).await });
    }
    {
        let scheduler = state.scheduler.clone();
        let token = cancel.clone();
        coordinators.spawn(async move { run_reaper_loop(scheduler, token).await });
    }

    let app = build_router(state);
    tracing::info!("stellar controller listening on http://{addr}");

    let shutdown = cancel.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install ctrl-c handler");
            shutdown.cancel();
        })
        .await;

    cancel.cancel();
    while coordinators.join_next().await.is_some() {}
    tracing::info!("stellar controller shut down");

    result.map_err(|e| ServeError::Other(e.into()))
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<axum::response::Response, AppError> {
    let response = state.nodes.register(&req).await?;
    Ok(Json(response).into_response())
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(hb): Json<NodeHeartbeat>,
) -> Result<StatusCode, AppError> {
    let node = authenticate(&state, id, &headers).await?;
    state.nodes.heartbeat(&node, &hb).await?;
    Ok(StatusCode::OK)
}

async fn unregister(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    authenticate(&state, id, &headers).await?;
    state.nodes.unregister(id).await?;
    Ok(StatusCode::OK)
}

async fn node_config(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<NodeConfigDecl>, AppError> {
    let node = authenticate(&state, id, &headers).await?;
    Ok(Json(node.config.0))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullQuery {
    node_id: Uuid,
    /// Comma-separated task types the worker accepts.
    #[serde(default)]
    types: Option<String>,
}

async fn pull_assigned(
    State(state): State<AppState>,
    Query(query): Query<PullQuery>,
    headers: HeaderMap,
) -> Result<axum::response::Response, AppError> {
    authenticate(&state, query.node_id, &headers).await?;

    let mut types: Vec<TaskType> = Vec::new();
    if let Some(accepted) = &query.types {
        for part in accepted.split(',').filter(|p| !p.trim().is_empty()) {
            let parsed = part
                .trim()
                .parse::<TaskType>()
                .map_err(|e| AppError::from(Error::Validation(e.to_string())))?;
            types.push(parsed);
        }
    }

    // Long poll: return the first assigned task within the window, 204
    // otherwise.
    let deadline = tokio::time::Instant::now() + state.pull_window;
    loop {
        let task = task_db::assigned_task_for_node(&state.pool, query.node_id, &types)
            .await
            .map_err(|e| AppError::from(Error::Internal(e)))?;

        if let Some(task) = task {
            let envelope = TaskEnvelope {
                id: task.id,
                name: task.name,
                task_type: task.task_type,
                priority: task.priority.as_i32(),
                project_id: task.project_id,
                timeout_secs: task.timeout_secs,
                retry_count: task.retry_count,
                params: task.params.0,
            };
            return Ok(Json(envelope).into_response());
        }

        if tokio::time::Instant::now() + state.pull_interval > deadline {
            return Ok(StatusCode::NO_CONTENT.into_response());
        }
        tokio::time::sleep(state.pull_interval).await;
    }
}

async fn report_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(report): Json<StatusReport>,
) -> Result<StatusCode, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(|e| AppError::from(Error::Internal(e)))?
        .ok_or_else(|| AppError::from(Error::NotFound(format!("task {id}"))))?;

    let node_id = report
        .node_id
        .or(task.assigned_node)
        .ok_or_else(|| AppError::unauthorized("task has no assigned node"))?;
    authenticate(&state, node_id, &headers).await?;

    state.scheduler.handle_status_report(id, &report).await?;
    Ok(StatusCode::OK)
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Task>, AppError> {
    let task = task_db::get_task(&state.pool, id)
        .await
        .map_err(|e| AppError::from(Error::Internal(e)))?
        .ok_or_else(|| AppError::from(Error::NotFound(format!("task {id}"))))?;

    let node_id = task
        .assigned_node
        .ok_or_else(|| AppError::unauthorized("task has no assigned node"))?;
    authenticate(&state, node_id, &headers).await?;

    Ok(Json(task))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
