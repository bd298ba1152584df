//! Database query functions for the `takeover_rules` table.
//!
//! The persisted rule set is authoritative; the checker loads it at startup
//! and on explicit reload. Rules match in `position` order.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::TakeoverRule;

/// Insert a fingerprint rule. Returns the inserted row.
pub async fn insert_rule(
    pool: &PgPool,
    service: &str,
    cname_pattern: &str,
    body_pattern: Option<&str>,
    position: i32,
) -> Result<TakeoverRule> {
    let rule = sqlx::query_as::<_, TakeoverRule>(
        "INSERT INTO takeover_rules (service, cname_pattern, body_pattern, position) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(service)
    .bind(cname_pattern)
    .bind(body_pattern)
    .bind(position)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert takeover rule for {service}"))?;

    Ok(rule)
}

/// All rules in match order.
pub async fn list_rules(pool: &PgPool) -> Result<Vec<TakeoverRule>> {
    let rules = sqlx::query_as::<_, TakeoverRule>(
        "SELECT * FROM takeover_rules ORDER BY position ASC, created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list takeover rules")?;

    Ok(rules)
}

/// Delete a rule by ID.
pub async fn delete_rule(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM takeover_rules WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete takeover rule")?;

    Ok(result.rows_affected())
}
