//! Worker mode: registers with a controller, heartbeats, long-polls for
//! assigned tasks, runs the subdomain-enumeration pipeline locally, and
//! reports progress and results over the worker protocol.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stellar_core::enumerate::{
    self, CertTransparency, DnsBrute, EnumMethod, EnumerationConfig, PassiveSources,
    TakeoverChecker, ZoneTransfer,
};
use stellar_core::error::WorkerErrorClass;
use stellar_core::ingest::subdomain as subdomain_ingest;
use stellar_core::protocol::{
    NodeHeartbeat, RegisterRequest, RegisterResponse, StatusReport, TaskEnvelope,
};
use stellar_core::resolve::{ResolverPool, ResolverPoolConfig};
use stellar_db::models::{
    NodeConfigDecl, NodeRole, NodeStatus, TakeoverRule, TaskStatus, TaskType,
};

/// Options for `stellar worker`.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub controller_url: String,
    pub name: String,
    pub ip: String,
    pub port: i32,
    pub tags: Vec<String>,
    pub heartbeat_interval_secs: i64,
    pub max_concurrent_tasks: i32,
    pub dictionary_path: Option<PathBuf>,
    pub resolvers: Vec<SocketAddr>,
}

/// Authenticated protocol client for one registered node.
#[derive(Clone)]
struct WorkerApi {
    client: reqwest::Client,
    base: String,
    node_id: Uuid,
    api_key: String,
}

impl WorkerApi {
    async fn pull(&self) -> Result<Option<TaskEnvelope>> {
        let response = self
            .client
            .get(format!(
                "{}/tasks/assigned?nodeId={}&types=subdomain_enum",
                self.base, self.node_id
            ))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(40))
            .send()
            .await
            .context("task pull failed")?;

        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let envelope = response
            .error_for_status()
            .context("task pull rejected")?
            .json()
            .await
            .context("task envelope decode failed")?;
        Ok(Some(envelope))
    }

    async fn report(&self, task_id: Uuid, report: &StatusReport) -> Result<()> {
        self.client
            .put(format!("{}/tasks/{task_id}/status", self.base))
            .bearer_auth(&self.api_key)
            .json(report)
            .send()
            .await
            .context("status report failed")?
            .error_for_status()
            .context("status report rejected")?;
        Ok(())
    }

    /// Poll the task for the server-side cancel signal. Returns true when
    /// the controller wants this attempt stopped.
    async fn cancel_requested(&self, task_id: Uuid) -> bool {
        let response = self
            .client
            .get(format!("{}/tasks/{task_id}", self.base))
            .bearer_auth(&self.api_key)
            .send()
            .await;
        let Ok(response) = response else { return false };
        let Ok(task) = response.json::<serde_json::Value>().await else {
            return false;
        };
        if task["cancel_requested"].as_bool() == Some(true) {
            return true;
        }
        matches!(
            task["status"].as_str(),
            Some("canceled") | Some("timeout") | Some("failed")
        )
    }

    async fn heartbeat(&self, running_tasks: i32) -> Result<()> {
        let hb = NodeHeartbeat {
            node_id: self.node_id,
            timestamp: Utc::now(),
            status: NodeStatus::Online,
            cpu_percent: 0.0,
            memory_mb: 0.0,
            disk_mb: 0.0,
            load_average: [0.0, 0.0, 0.0],
            running_tasks,
            queued_tasks: 0,
            network_in_kbps: 0.0,
            network_out_kbps: 0.0,
            uptime_secs: 0,
            version: Some(env!("CARGO_PKG_VERSION").to_owned()),
        };
        self.client
            .post(format!("{}/nodes/{}/heartbeat", self.base, self.node_id))
            .bearer_auth(&self.api_key)
            .json(&hb)
            .send()
            .await
            .context("heartbeat send failed")?
            .error_for_status()
            .context("heartbeat rejected")?;
        Ok(())
    }

    async fn unregister(&self) {
        let _ = self
            .client
            .post(format!("{}/nodes/unregister/{}", self.base, self.node_id))
            .bearer_auth(&self.api_key)
            .send()
            .await;
    }
}

/// Run the worker until ctrl-c.
pub async fn run_worker(opts: WorkerOptions) -> Result<()> {
    let client = reqwest::Client::new();
    let base = opts.controller_url.trim_end_matches('/').to_owned();

    let config = NodeConfigDecl {
        max_concurrent_tasks: opts.max_concurrent_tasks,
        heartbeat_interval_secs: opts.heartbeat_interval_secs,
        enabled_task_types: vec![TaskType::SubdomainEnum],
        ..NodeConfigDecl::default()
    };

    let registration: RegisterResponse = client
        .post(format!("{base}/nodes/register"))
        .json(&RegisterRequest {
            name: opts.name.clone(),
            ip: opts.ip.clone(),
            port: opts.port,
            role: NodeRole::Worker,
            tags: opts.tags.clone(),
            config: Some(config),
        })
        .send()
        .await
        .context("registration request failed")?
        .error_for_status()
        .context("registration rejected")?
        .json()
        .await
        .context("registration response decode failed")?;

    tracing::info!(node_id = %registration.node_id, "registered with controller");

    let api = WorkerApi {
        client,
        base,
        node_id: registration.node_id,
        api_key: registration.api_key,
    };

    let running = Arc::new(AtomicI32::new(0));
    let shutdown = CancellationToken::new();

    // Heartbeat coordinator.
    let hb_api = api.clone();
    let hb_running = Arc::clone(&running);
    let hb_shutdown = shutdown.clone();
    let interval = Duration::from_secs(opts.heartbeat_interval_secs.max(1) as u64);
    let heartbeats = tokio::spawn(async move {
        loop {
            if let Err(e) = hb_api.heartbeat(hb_running.load(Ordering::Relaxed)).await {
                tracing::warn!(error = %e, "heartbeat failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = hb_shutdown.cancelled() => return,
            }
        }
    });

    // Pull loop.
    loop {
        let envelope = tokio::select! {
            e = api.pull() => e,
            _ = tokio::signal::ctrl_c() => break,
        };

        let envelope = match envelope {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "pull failed; backing off");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        tracing::info!(task_id = %envelope.id, name = %envelope.name, "task received");
        running.store(1, Ordering::Relaxed);
        if let Err(e) = run_task(&api, &opts, &envelope).await {
            tracing::error!(task_id = %envelope.id, error = %e, "task execution failed");
        }
        running.store(0, Ordering::Relaxed);
    }

    shutdown.cancel();
    let _ = heartbeats.await;
    api.unregister().await;
    tracing::info!("worker shut down");
    Ok(())
}

/// Execute one assigned task end to end: ack, run the pipeline, report.
async fn run_task(api: &WorkerApi, opts: &WorkerOptions, envelope: &TaskEnvelope) -> Result<()> {
    // Ack: assigned -> running.
    api.report(
        envelope.id,
        &StatusReport {
            status: TaskStatus::Running,
            node_id: Some(api.node_id),
            progress: Some(0.0),
            result_data: None,
            summary: None,
            error: None,
            error_class: None,
        },
    )
    .await?;

    if envelope.task_type != TaskType::SubdomainEnum {
        api.report(
            envelope.id,
            &StatusReport {
                status: TaskStatus::Failed,
                node_id: Some(api.node_id),
                progress: None,
                result_data: None,
                summary: None,
                error: Some(format!(
                    "task type {} is not enabled on this worker",
                    envelope.task_type
                )),
                error_class: Some(WorkerErrorClass::Validation),
            },
        )
        .await?;
        return Ok(());
    }

    let cancel = CancellationToken::new();

    // Watch for the server-side cancel signal.
    let watch_api = api.clone();
    let watch_cancel = cancel.clone();
    let task_id = envelope.id;
    let cancel_watch = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                _ = watch_cancel.cancelled() => return,
            }
            if watch_api.cancel_requested(task_id).await {
                tracing::info!(task_id = %task_id, "controller requested cancellation");
                watch_cancel.cancel();
                return;
            }
        }
    });

    let outcome = run_subdomain_enum(api, opts, envelope, cancel.clone()).await;
    cancel.cancel();
    let _ = cancel_watch.await;

    match outcome {
        Ok(None) => Ok(()), // canceled: the controller already holds the terminal state
        Ok(Some(report)) => api.report(envelope.id, &report).await,
        Err(e) => {
            api.report(
                envelope.id,
                &StatusReport {
                    status: TaskStatus::Failed,
                    node_id: Some(api.node_id),
                    progress: None,
                    result_data: None,
                    summary: None,
                    error: Some(format!("{e:#}")),
                    error_class: Some(WorkerErrorClass::Transient),
                },
            )
            .await
        }
    }
}

/// Run the enumeration pipeline for a task. Returns `None` when the run was
/// canceled, otherwise the terminal report to send.
async fn run_subdomain_enum(
    api: &WorkerApi,
    opts: &WorkerOptions,
    envelope: &TaskEnvelope,
    cancel: CancellationToken,
) -> Result<Option<StatusReport>> {
    let params = &envelope.params;

    let root = params
        .get("root_domain")
        .or_else(|| params.get("rootDomain"))
        .or_else(|| params.get("domain"))
        .and_then(|v| v.as_str())
        .context("task params carry no root_domain")?
        .to_owned();

    let mut config = EnumerationConfig::new(&root);
    if let Some(c) = params.get("concurrency").and_then(|v| v.as_u64()) {
        config.concurrency = c.max(1) as usize;
    }
    if let Some(w) = params.get("include_wildcards").and_then(|v| v.as_bool()) {
        config.include_wildcards = w;
    }

    let resolver = Arc::new(ResolverPool::from_upstreams(
        &opts.resolvers,
        ResolverPoolConfig::default(),
    ));

    let takeover = Arc::new(load_takeover_rules(params)?);
    let methods = build_methods(params, opts, &resolver)?;

    let run = enumerate::start(
        config,
        resolver,
        takeover,
        methods,
        cancel.clone(),
    );

    // Forward progress at most once per second.
    let progress_api = api.clone();
    let mut progress_rx = run.progress.clone();
    let task_id = envelope.id;
    let progress_cancel = cancel.clone();
    let progress_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = progress_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let value = *progress_rx.borrow_and_update() * 100.0;
                    let _ = progress_api
                        .report(
                            task_id,
                            &StatusReport {
                                status: TaskStatus::Running,
                                node_id: None,
                                progress: Some(value),
                                result_data: None,
                                summary: None,
                                error: None,
                                error_class: None,
                            },
                        )
                        .await;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                _ = progress_cancel.cancelled() => return,
            }
        }
    });

    let collected = subdomain_ingest::collect_run(run).await;
    progress_task.abort();

    let (data, summary) = match collected {
        Ok(ok) => ok,
        Err(e) => bail!("enumeration pipeline failed: {e}"),
    };

    if summary.canceled {
        return Ok(None);
    }

    Ok(Some(StatusReport {
        status: TaskStatus::Completed,
        node_id: Some(api.node_id),
        progress: Some(100.0),
        result_data: Some(serde_json::to_value(&data).context("encode result data")?),
        summary: Some(subdomain_ingest::summary_text(&summary)),
        error: None,
        error_class: None,
    }))
}

/// Build the configured method set. Defaults to dns-brute alone.
fn build_methods(
    params: &serde_json::Value,
    opts: &WorkerOptions,
    resolver: &Arc<ResolverPool>,
) -> Result<Vec<Arc<dyn EnumMethod>>> {
    let names: Vec<String> = params
        .get("methods")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_else(|| vec!["dns_brute".to_owned()]);

    let http = reqwest::Client::new();
    let mut methods: Vec<Arc<dyn EnumMethod>> = Vec::new();

    for name in names {
        match name.as_str() {
            "dns_brute" => {
                methods.push(Arc::new(DnsBrute::new(load_dictionary(params, opts)?)));
            }
            "cert_transparency" => {
                let method = match params.get("ct_base_url").and_then(|v| v.as_str()) {
                    Some(url) => CertTransparency::with_base_url(http.clone(), url),
                    None => CertTransparency::new(http.clone()),
                };
                methods.push(Arc::new(method));
            }
            "passive_sources" => {
                let endpoints: Vec<String> = params
                    .get("passive_endpoints")
                    .and_then(|v| v.as_array())
                    .map(|list| {
                        list.iter()
                            .filter_map(|v| v.as_str().map(str::to_owned))
                            .collect()
                    })
                    .unwrap_or_default();
                if endpoints.is_empty() {
                    bail!("passive_sources requires passive_endpoints in task params");
                }
                methods.push(Arc::new(PassiveSources::new(http.clone(), endpoints)));
            }
            "dns_zone_transfer" => {
                methods.push(Arc::new(ZoneTransfer::new(Arc::clone(resolver))));
            }
            other => bail!("unknown enumeration method {other:?}"),
        }
    }

    Ok(methods)
}

/// Dictionary resolution: inline task params win, then the worker's
/// dictionary file, then a small built-in list.
fn load_dictionary(params: &serde_json::Value, opts: &WorkerOptions) -> Result<Vec<String>> {
    if let Some(words) = params.get("dictionary").and_then(|v| v.as_array()) {
        return Ok(words
            .iter()
            .filter_map(|v| v.as_str().map(str::to_owned))
            .collect());
    }

    if let Some(path) = &opts.dictionary_path {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read dictionary {}", path.display()))?;
        return Ok(contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_owned)
            .collect());
    }

    Ok(DEFAULT_WORDS.iter().map(|w| w.to_string()).collect())
}

const DEFAULT_WORDS: &[&str] = &[
    "www", "mail", "remote", "blog", "webmail", "server", "ns1", "ns2", "smtp", "secure", "vpn",
    "m", "shop", "ftp", "api", "dev", "staging", "test", "portal", "admin", "cdn", "app", "beta",
    "gateway", "internal", "docs", "status", "git", "ci", "grafana",
];

/// Parse take-over rules embedded in task params. The controller embeds
/// the persisted rule set at submission time; an absent key means no
/// take-over flagging on this worker.
fn load_takeover_rules(params: &serde_json::Value) -> Result<TakeoverChecker> {
    let Some(entries) = params.get("takeover_rules").and_then(|v| v.as_array()) else {
        return Ok(TakeoverChecker::empty());
    };

    let mut rules = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let service = entry
            .get("service")
            .and_then(|v| v.as_str())
            .with_context(|| format!("takeover rule {i} missing service"))?;
        let pattern = entry
            .get("cnamePattern")
            .or_else(|| entry.get("cname_pattern"))
            .and_then(|v| v.as_str())
            .with_context(|| format!("takeover rule {i} missing cname pattern"))?;
        let body = entry
            .get("bodyPattern")
            .or_else(|| entry.get("body_pattern"))
            .and_then(|v| v.as_str());

        rules.push(TakeoverRule {
            id: Uuid::new_v4(),
            service: service.to_owned(),
            cname_pattern: pattern.to_owned(),
            body_pattern: body.map(str::to_owned),
            position: i as i32,
            created_at: Utc::now(),
        });
    }

    TakeoverChecker::from_rules(rules).map_err(|e| anyhow::anyhow!(e))
}
