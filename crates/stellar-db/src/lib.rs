//! Persistence layer for the stellar controller.
//!
//! Owns the PostgreSQL schema and all query functions. The `nodes` table is
//! the node registry; `tasks`, `task_results`, and `task_events` form the
//! task store; `subdomain_results` and `subdomain_assets` hold enumeration
//! output; `takeover_rules` holds the fingerprint rule set.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
