//! Operator commands for the take-over fingerprint rule set.
//!
//! The persisted set is authoritative: an empty table means no take-over
//! flagging anywhere in the platform.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use stellar_db::queries::takeover_rules;

use crate::RuleCommands;

pub async fn run_rule_command(command: RuleCommands, pool: &PgPool) -> Result<()> {
    match command {
        RuleCommands::Add {
            service,
            cname_pattern,
            body_pattern,
            position,
        } => {
            // Compile-check the body pattern before persisting it.
            if let Some(pattern) = &body_pattern {
                regex::Regex::new(pattern)
                    .with_context(|| format!("invalid body pattern {pattern:?}"))?;
            }
            let rule = takeover_rules::insert_rule(
                pool,
                &service,
                &cname_pattern,
                body_pattern.as_deref(),
                position,
            )
            .await?;
            println!("Rule {} added for {}.", rule.id, rule.service);
        }
        RuleCommands::List => {
            let rules = takeover_rules::list_rules(pool).await?;
            println!("{:<38} {:<6} {:<22} PATTERN", "ID", "POS", "SERVICE");
            for rule in &rules {
                println!(
                    "{:<38} {:<6} {:<22} {}",
                    rule.id, rule.position, rule.service, rule.cname_pattern,
                );
            }
            if rules.is_empty() {
                println!("\nNo rules; take-over detection is disabled.");
            }
        }
        RuleCommands::Remove { rule_id } => {
            let id =
                Uuid::parse_str(&rule_id).with_context(|| format!("invalid rule ID: {rule_id}"))?;
            let removed = takeover_rules::delete_rule(pool, id).await?;
            if removed == 0 {
                anyhow::bail!("rule {rule_id} not found");
            }
            println!("Rule {rule_id} removed.");
        }
    }
    Ok(())
}
