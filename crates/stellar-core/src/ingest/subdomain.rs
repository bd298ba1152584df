//! The subdomain-enumeration result sink.

use sqlx::PgPool;

use stellar_db::models::Task;
use stellar_db::queries::subdomain_results::{
    self, NewSubdomainAsset, NewSubdomainResult,
};

use crate::enumerate::{EnumerationRun, EnumerationSummary};
use crate::error::{Error, Result};
use crate::protocol::{SubdomainEnumData, SubdomainResultData};

/// Whether a task's parameters request asset creation (default: yes).
fn assets_requested(task: &Task) -> bool {
    task.params
        .get("create_assets")
        .and_then(|v| v.as_bool())
        .unwrap_or(true)
}

/// Write a reported envelope's results into the store: one
/// `subdomain_results` row per FQDN and, when requested, one upserted
/// `subdomain_assets` row per live host.
pub async fn ingest_envelope(pool: &PgPool, task: &Task, data: &SubdomainEnumData) -> Result<()> {
    let create_assets = assets_requested(task);

    for result in &data.results {
        ingest_one(pool, task, result, create_assets).await?;
    }

    tracing::info!(
        task_id = %task.id,
        results = data.results.len(),
        assets = create_assets,
        "ingested subdomain results"
    );
    Ok(())
}

async fn ingest_one(
    pool: &PgPool,
    task: &Task,
    result: &SubdomainResultData,
    create_assets: bool,
) -> Result<()> {
    let stored = subdomain_results::upsert_result(
        pool,
        &NewSubdomainResult {
            task_id: task.id,
            subdomain: result.subdomain.clone(),
            root_domain: result.root_domain.clone(),
            ips: result.ips.clone(),
            cname: result.cname.clone(),
            record_type: result.record_type.clone(),
            records: result.records.clone(),
            is_wildcard: result.is_wildcard,
            is_resolved: result.is_resolved,
            is_takeover: result.is_takeover,
            takeover_kind: result.takeover_kind.clone(),
            sources: result.sources.clone(),
        },
    )
    .await
    .map_err(Error::Internal)?;

    // Wildcard and unresolved names are recorded but never become assets.
    if !create_assets || result.is_wildcard || !result.is_resolved {
        return Ok(());
    }

    let asset = subdomain_results::upsert_asset(
        pool,
        &NewSubdomainAsset {
            project_id: task.project_id,
            host: result.subdomain.clone(),
            root_domain: result.root_domain.clone(),
            ips: result.ips.clone(),
            cname: result.cname.clone(),
            is_takeover: result.is_takeover,
            source_task_id: task.id,
            tags: task.tags.clone(),
        },
    )
    .await
    .map_err(Error::Internal)?;

    subdomain_results::set_asset_id(pool, stored.id, asset.id)
        .await
        .map_err(Error::Internal)?;

    Ok(())
}

/// Drain a pipeline run to completion (worker side), producing the
/// envelope payload and the run summary.
pub async fn collect_run(
    mut run: EnumerationRun,
) -> Result<(SubdomainEnumData, EnumerationSummary)> {
    let mut results: Vec<SubdomainResultData> = Vec::new();

    while let Some(found) = run.results.recv().await {
        results.push(SubdomainResultData {
            subdomain: found.subdomain,
            root_domain: found.root_domain,
            ips: found.ips,
            cname: found.cname,
            record_type: found.record_type,
            records: found.records,
            is_wildcard: found.is_wildcard,
            is_resolved: found.is_resolved,
            is_takeover: found.is_takeover,
            takeover_kind: found.takeover_kind,
            sources: found.sources,
        });
    }

    let summary = run
        .done
        .await
        .map_err(|e| Error::Internal(e.into()))??;

    let data = SubdomainEnumData {
        total_found: summary.total_found,
        resolved_count: summary.resolved_count,
        wildcard_count: summary.wildcard_count,
        takeover_count: summary.takeover_count,
        method_stats: summary.method_stats.clone(),
        results,
    };

    Ok((data, summary))
}

/// One-line human summary for the stored result.
pub fn summary_text(summary: &EnumerationSummary) -> String {
    format!(
        "found {} subdomains ({} resolved, {} wildcard-filtered, {} takeover candidates)",
        summary.total_found,
        summary.resolved_count,
        summary.wildcard_count,
        summary.takeover_count
    )
}
