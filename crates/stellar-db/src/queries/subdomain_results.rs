//! Database query functions for the `subdomain_results` and
//! `subdomain_assets` tables.
//!
//! Ingestion from the pipeline is at-least-once; both tables upsert on
//! their dedup keys so replays are idempotent.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::models::{AssetChange, DnsRecordData, SubdomainAsset, SubdomainResult};

/// Parameters for upserting a subdomain result row.
#[derive(Debug, Clone)]
pub struct NewSubdomainResult {
    pub task_id: Uuid,
    pub subdomain: String,
    pub root_domain: String,
    pub ips: Vec<String>,
    pub cname: Option<String>,
    pub record_type: String,
    pub records: Vec<DnsRecordData>,
    pub is_wildcard: bool,
    pub is_resolved: bool,
    pub is_takeover: bool,
    pub takeover_kind: Option<String>,
    pub sources: Vec<String>,
}

/// Insert a result keyed by `(task_id, subdomain)`. A replay of the same
/// subdomain merges the discovery sources instead of duplicating the row.
pub async fn upsert_result(pool: &PgPool, new: &NewSubdomainResult) -> Result<SubdomainResult> {
    let result = sqlx::query_as::<_, SubdomainResult>(
        "INSERT INTO subdomain_results \
         (task_id, subdomain, root_domain, ips, cname, record_type, records, \
          is_wildcard, is_resolved, is_takeover, takeover_kind, sources) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
         ON CONFLICT (task_id, subdomain) DO UPDATE SET \
             sources = ARRAY(SELECT DISTINCT unnest(subdomain_results.sources || EXCLUDED.sources)) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(&new.subdomain)
    .bind(&new.root_domain)
    .bind(&new.ips)
    .bind(&new.cname)
    .bind(&new.record_type)
    .bind(Json(&new.records))
    .bind(new.is_wildcard)
    .bind(new.is_resolved)
    .bind(new.is_takeover)
    .bind(&new.takeover_kind)
    .bind(&new.sources)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert subdomain result {}", new.subdomain))?;

    Ok(result)
}

/// Link a stored result to the asset derived from it.
pub async fn set_asset_id(pool: &PgPool, result_id: Uuid, asset_id: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE subdomain_results SET asset_id = $1 WHERE id = $2")
        .bind(asset_id)
        .bind(result_id)
        .execute(pool)
        .await
        .context("failed to link subdomain result to asset")?;

    Ok(result.rows_affected())
}

/// All results for a task, in discovery order.
pub async fn list_results_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<SubdomainResult>> {
    let results = sqlx::query_as::<_, SubdomainResult>(
        "SELECT * FROM subdomain_results WHERE task_id = $1 ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list subdomain results")?;

    Ok(results)
}

/// Parameters for upserting an asset derived from a result.
#[derive(Debug, Clone)]
pub struct NewSubdomainAsset {
    pub project_id: Uuid,
    pub host: String,
    pub root_domain: String,
    pub ips: Vec<String>,
    pub cname: Option<String>,
    pub is_takeover: bool,
    pub source_task_id: Uuid,
    pub tags: Vec<String>,
}

/// Upsert an asset keyed by `(project_id, host)`.
///
/// A new host inserts. An existing host updates IPs, CNAME, and take-over
/// state, and appends one entry to `change_history` only when at least one
/// of those three actually differs from the stored row; a replay carrying
/// identical values leaves the history untouched. The history is bounded:
/// when it already holds 50 entries the oldest (index 0) is dropped before
/// the append.
pub async fn upsert_asset(pool: &PgPool, new: &NewSubdomainAsset) -> Result<SubdomainAsset> {
    let change = AssetChange {
        changed_at: Utc::now(),
        task_id: new.source_task_id,
        ips: new.ips.clone(),
        cname: new.cname.clone(),
        is_takeover: new.is_takeover,
    };
    let change_json = serde_json::to_value(vec![&change]).context("serialize asset change")?;

    let asset = sqlx::query_as::<_, SubdomainAsset>(
        "INSERT INTO subdomain_assets \
         (project_id, host, root_domain, ips, cname, is_takeover, source_task_id, tags, change_history) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         ON CONFLICT (project_id, host) DO UPDATE SET \
             ips = EXCLUDED.ips, \
             cname = EXCLUDED.cname, \
             is_takeover = EXCLUDED.is_takeover, \
             source_task_id = EXCLUDED.source_task_id, \
             updated_at = NOW(), \
             change_history = (CASE \
                 WHEN subdomain_assets.ips IS NOT DISTINCT FROM EXCLUDED.ips \
                      AND subdomain_assets.cname IS NOT DISTINCT FROM EXCLUDED.cname \
                      AND subdomain_assets.is_takeover IS NOT DISTINCT FROM EXCLUDED.is_takeover \
                 THEN subdomain_assets.change_history \
                 WHEN jsonb_array_length(subdomain_assets.change_history) >= 50 \
                 THEN (subdomain_assets.change_history - 0) || EXCLUDED.change_history \
                 ELSE subdomain_assets.change_history || EXCLUDED.change_history \
             END) \
         RETURNING *",
    )
    .bind(new.project_id)
    .bind(&new.host)
    .bind(&new.root_domain)
    .bind(&new.ips)
    .bind(&new.cname)
    .bind(new.is_takeover)
    .bind(new.source_task_id)
    .bind(&new.tags)
    .bind(Json(&change_json))
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert asset {}", new.host))?;

    Ok(asset)
}

/// Fetch an asset by its dedup key.
pub async fn get_asset(
    pool: &PgPool,
    project_id: Uuid,
    host: &str,
) -> Result<Option<SubdomainAsset>> {
    let asset = sqlx::query_as::<_, SubdomainAsset>(
        "SELECT * FROM subdomain_assets WHERE project_id = $1 AND host = $2",
    )
    .bind(project_id)
    .bind(host)
    .fetch_optional(pool)
    .await
    .context("failed to fetch subdomain asset")?;

    Ok(asset)
}
