//! Database query functions for the `subdomain_dictionaries` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// A named brute-force word list.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, FromRow)]
pub struct SubdomainDictionary {
    pub id: Uuid,
    pub name: String,
    pub words: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert or replace a dictionary by name.
pub async fn upsert_dictionary(
    pool: &PgPool,
    name: &str,
    words: &[String],
) -> Result<SubdomainDictionary> {
    let dictionary = sqlx::query_as::<_, SubdomainDictionary>(
        "INSERT INTO subdomain_dictionaries (name, words) \
         VALUES ($1, $2) \
         ON CONFLICT (name) DO UPDATE SET \
             words = EXCLUDED.words, \
             updated_at = NOW() \
         RETURNING *",
    )
    .bind(name)
    .bind(words)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert dictionary {name}"))?;

    Ok(dictionary)
}

/// Fetch a dictionary by name.
pub async fn get_dictionary(pool: &PgPool, name: &str) -> Result<Option<SubdomainDictionary>> {
    let dictionary = sqlx::query_as::<_, SubdomainDictionary>(
        "SELECT * FROM subdomain_dictionaries WHERE name = $1",
    )
    .bind(name)
    .fetch_optional(pool)
    .await
    .with_context(|| format!("failed to fetch dictionary {name}"))?;

    Ok(dictionary)
}

/// List dictionary names with word counts.
pub async fn list_dictionaries(pool: &PgPool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT name, cardinality(words)::bigint \
         FROM subdomain_dictionaries ORDER BY name",
    )
    .fetch_all(pool)
    .await
    .context("failed to list dictionaries")?;

    Ok(rows)
}

/// Delete a dictionary by name. Returns the number of rows removed.
pub async fn delete_dictionary(pool: &PgPool, name: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM subdomain_dictionaries WHERE name = $1")
        .bind(name)
        .execute(pool)
        .await
        .with_context(|| format!("failed to delete dictionary {name}"))?;

    Ok(result.rows_affected())
}
