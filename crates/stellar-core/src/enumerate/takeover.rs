//! Dangling-CNAME take-over detection.
//!
//! Holds an ordered list of fingerprint rules loaded from the store. A
//! result with a CNAME is matched against each rule's pattern in order;
//! the first match marks the result as a take-over candidate. Rules can be
//! swapped atomically at runtime; readers hold the lock only to match.

use std::sync::RwLock;

use regex::Regex;

use stellar_db::models::TakeoverRule;

use crate::error::{Error, Result};

#[derive(Debug)]
struct CompiledRule {
    service: String,
    cname_pattern: String,
    body_pattern: Option<Regex>,
}

/// A matched rule: the service name and whether HTTP-body confirmation is
/// available for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeoverMatch {
    pub service: String,
    pub has_body_check: bool,
}

/// The take-over checker.
pub struct TakeoverChecker {
    rules: RwLock<Vec<CompiledRule>>,
}

impl TakeoverChecker {
    /// Build a checker from persisted rules, compiling body regexes.
    pub fn from_rules(rules: Vec<TakeoverRule>) -> Result<Self> {
        let compiled = compile(rules)?;
        Ok(Self {
            rules: RwLock::new(compiled),
        })
    }

    /// An empty checker that never matches.
    pub fn empty() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
        }
    }

    /// Atomically replace the rule set.
    pub fn reload(&self, rules: Vec<TakeoverRule>) -> Result<()> {
        let compiled = compile(rules)?;
        *self.rules.write().expect("takeover rule lock poisoned") = compiled;
        Ok(())
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().expect("takeover rule lock poisoned").len()
    }

    /// Match a CNAME against the rules in order; first match wins.
    pub fn match_cname(&self, cname: &str) -> Option<TakeoverMatch> {
        let rules = self.rules.read().expect("takeover rule lock poisoned");
        rules
            .iter()
            .find(|rule| pattern_matches(&rule.cname_pattern, cname))
            .map(|rule| TakeoverMatch {
                service: rule.service.clone(),
                has_body_check: rule.body_pattern.is_some(),
            })
    }

    /// Confirm a matched service by fetching the host and testing the
    /// rule's body pattern. Hosts that do not answer HTTP stay flagged:
    /// a dangling name with no listener is still dangling.
    pub async fn confirm_by_body(
        &self,
        client: &reqwest::Client,
        host: &str,
        service: &str,
    ) -> bool {
        let pattern = {
            let rules = self.rules.read().expect("takeover rule lock poisoned");
            rules
                .iter()
                .find(|r| r.service == service)
                .and_then(|r| r.body_pattern.clone())
        };
        let Some(pattern) = pattern else {
            return true;
        };

        match client.get(format!("http://{host}/")).send().await {
            Ok(response) => match response.text().await {
                Ok(body) => pattern.is_match(&body),
                Err(_) => true,
            },
            Err(_) => true,
        }
    }
}

fn compile(rules: Vec<TakeoverRule>) -> Result<Vec<CompiledRule>> {
    rules
        .into_iter()
        .map(|rule| {
            let body_pattern = rule
                .body_pattern
                .as_deref()
                .map(Regex::new)
                .transpose()
                .map_err(|e| {
                    Error::Validation(format!(
                        "invalid body pattern for rule {}: {e}",
                        rule.service
                    ))
                })?;
            Ok(CompiledRule {
                service: rule.service,
                cname_pattern: rule.cname_pattern,
                body_pattern,
            })
        })
        .collect()
}

/// Match a CNAME against a rule pattern.
///
/// Patterns containing `*` are globs (each `*` spans any run of
/// characters); plain patterns match as a domain suffix.
pub fn pattern_matches(pattern: &str, cname: &str) -> bool {
    let pattern = pattern.trim_end_matches('.').to_ascii_lowercase();
    let cname = cname.trim_end_matches('.').to_ascii_lowercase();
    if pattern.is_empty() || cname.is_empty() {
        return false;
    }

    if pattern.contains('*') {
        return glob_matches(&pattern, &cname);
    }

    cname == pattern || cname.ends_with(&format!(".{pattern}"))
}

fn glob_matches(pattern: &str, text: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            // Anchored prefix.
            if !text[pos..].starts_with(segment) {
                return false;
            }
            pos += segment.len();
        } else if i == segments.len() - 1 {
            // Anchored suffix.
            return text[pos..].ends_with(segment);
        } else {
            match text[pos..].find(segment) {
                Some(found) => pos += found + segment.len(),
                None => return false,
            }
        }
    }

    // Pattern ended with '*' (or was all '*'): anything remaining matches.
    true
}
