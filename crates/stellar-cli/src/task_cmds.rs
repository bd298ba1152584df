//! Operator commands for the task store and scheduler.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use stellar_core::node::{NodeManager, NodeManagerConfig};
use stellar_core::scheduler::{Scheduler, SchedulerConfig};
use stellar_core::state::dispatch;
use stellar_db::models::{TaskPriority, TaskStatus, TaskType};
use stellar_db::queries::dictionaries;
use stellar_db::queries::takeover_rules;
use stellar_db::queries::task_events;
use stellar_db::queries::task_results;
use stellar_db::queries::tasks::{self, NewTask, TaskFilter};

use crate::TaskCommands;

fn scheduler_for(pool: &PgPool) -> Scheduler {
    let nodes = NodeManager::new(pool.clone(), NodeManagerConfig::default());
    Scheduler::new(pool.clone(), nodes, SchedulerConfig::default())
}

pub async fn run_task_command(command: TaskCommands, pool: &PgPool) -> Result<()> {
    match command {
        TaskCommands::Submit {
            name,
            task_type,
            project,
            priority,
            timeout,
            max_retries,
            depends_on,
            params,
            dictionary,
            tag,
            description,
        } => {
            let task_type: TaskType = task_type.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
            let priority: TaskPriority = priority.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
            let project_id = Uuid::parse_str(&project)
                .with_context(|| format!("invalid project ID: {project}"))?;

            let mut params_value: serde_json::Value = match params {
                Some(raw) => serde_json::from_str(&raw).context("params must be valid JSON")?,
                None => serde_json::json!({}),
            };
            if !params_value.is_object() {
                anyhow::bail!("params must be a JSON object");
            }

            // Stored dictionaries are embedded so workers do not need
            // store access.
            if let Some(dict_name) = &dictionary {
                let dict = dictionaries::get_dictionary(pool, dict_name)
                    .await?
                    .with_context(|| format!("dictionary {dict_name:?} not found"))?;
                params_value["dictionary"] = serde_json::json!(dict.words);
            }

            // Subdomain tasks carry the authoritative take-over rule set so
            // workers do not need store access.
            if task_type == TaskType::SubdomainEnum
                && params_value.get("takeover_rules").is_none()
            {
                let rules = takeover_rules::list_rules(pool).await?;
                if !rules.is_empty() {
                    let embedded: Vec<serde_json::Value> = rules
                        .iter()
                        .map(|r| {
                            serde_json::json!({
                                "service": r.service,
                                "cnamePattern": r.cname_pattern,
                                "bodyPattern": r.body_pattern,
                            })
                        })
                        .collect();
                    params_value["takeover_rules"] = serde_json::Value::Array(embedded);
                }
            }

            let mut deps = Vec::with_capacity(depends_on.len());
            for dep in &depends_on {
                deps.push(
                    Uuid::parse_str(dep).with_context(|| format!("invalid dependency ID: {dep}"))?,
                );
            }

            let new = NewTask {
                description: description.unwrap_or_default(),
                priority,
                timeout_secs: timeout,
                max_retries,
                tags: tag,
                params: params_value,
                ..NewTask::new(name, task_type, project_id)
            };

            let scheduler = scheduler_for(pool);
            let task = scheduler
                .submit(&new, &deps)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("Task {} submitted as {}.", task.name, task.id);
        }
        TaskCommands::List {
            project,
            status,
            limit,
            offset,
        } => {
            let filter = TaskFilter {
                project_id: project
                    .as_deref()
                    .map(Uuid::parse_str)
                    .transpose()
                    .context("invalid project ID")?,
                status: status
                    .as_deref()
                    .map(str::parse::<TaskStatus>)
                    .transpose()
                    .map_err(|e| anyhow::anyhow!(e))?,
                task_type: None,
            };
            let (listed, total) = tasks::list_tasks(pool, &filter, limit, offset).await?;

            println!(
                "{:<38} {:<20} {:<10} {:<10} {:>5}  NAME",
                "ID", "TYPE", "STATUS", "PRIORITY", "PROG"
            );
            for task in &listed {
                println!(
                    "{:<38} {:<20} {:<10} {:<10} {:>4.0}%  {}",
                    task.id, task.task_type, task.status, task.priority, task.progress, task.name,
                );
            }
            println!("\n{} of {total} tasks shown.", listed.len());
        }
        TaskCommands::Show { task_id } => {
            let id = parse_id(&task_id)?;
            let task = tasks::get_task(pool, id)
                .await?
                .with_context(|| format!("task {task_id} not found"))?;

            println!("Task {} ({})", task.name, task.id);
            println!("  type:       {}", task.task_type);
            println!("  status:     {}", task.status);
            println!("  priority:   {}", task.priority);
            println!("  project:    {}", task.project_id);
            println!("  progress:   {:.0}%", task.progress);
            println!("  retries:    {}/{}", task.retry_count, task.max_retries);
            println!("  timeout:    {}s", task.timeout_secs);
            if let Some(node) = task.assigned_node {
                println!("  node:       {node}");
            }
            if let Some(error) = &task.error {
                println!("  error:      {error}");
            }
            let deps = tasks::get_dependencies(pool, id).await?;
            if !deps.is_empty() {
                println!(
                    "  depends on: {}",
                    deps.iter()
                        .map(|d| d.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
            }
            if let Some(result_id) = task.result_id {
                if let Some(result) = task_results::get_result(pool, result_id).await? {
                    println!("  result:     {} ({})", result.summary, result.status);
                }
            }
        }
        TaskCommands::Depend { task_id, on } => {
            let id = parse_id(&task_id)?;
            let dep = parse_id(&on)?;
            dispatch::add_dependency(pool, id, dep)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("Task {task_id} now depends on {on}.");
        }
        TaskCommands::Cancel { task_id } => {
            let id = parse_id(&task_id)?;
            let scheduler = scheduler_for(pool);
            scheduler
                .cancel(id)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("Task {task_id} canceled.");
        }
        TaskCommands::Retry { task_id } => {
            let id = parse_id(&task_id)?;
            let scheduler = scheduler_for(pool);
            scheduler
                .retry(id)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("Task {task_id} re-queued for retry.");
        }
        TaskCommands::Events { task_id } => {
            let id = parse_id(&task_id)?;
            let events = task_events::list_events_for_task(pool, id).await?;
            for event in &events {
                let node = event
                    .node_id
                    .map(|n| format!(" node={n}"))
                    .unwrap_or_default();
                println!(
                    "{}  {:<10} {:<10}{}  {}",
                    event.created_at, event.kind, event.status, node, event.message,
                );
            }
            if events.is_empty() {
                println!("No events for task {task_id}.");
            }
        }
    }
    Ok(())
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("invalid task ID: {raw}"))
}
