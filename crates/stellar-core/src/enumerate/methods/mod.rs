//! Enumeration methods: pluggable strategies that produce candidate
//! subdomains into a shared channel. The pipeline fans the configured set
//! out as parallel producers without knowing their concrete types.

mod brute;
mod ct_logs;
mod passive;
mod zone_transfer;

pub use brute::DnsBrute;
pub use ct_logs::CertTransparency;
pub use passive::PassiveSources;
pub use zone_transfer::ZoneTransfer;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A candidate subdomain surfaced by a method, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Fully-qualified name (any case; the pipeline lowercases).
    pub name: String,
    /// Name of the method that produced it.
    pub source: String,
}

/// A subdomain enumeration strategy.
#[async_trait]
pub trait EnumMethod: Send + Sync {
    /// Stable method name used in stats and result provenance.
    fn name(&self) -> &str;

    /// Expected candidate count, when the method knows it up front
    /// (dictionary methods do; network-driven methods return `None`).
    fn estimate(&self) -> Option<u64> {
        None
    }

    /// Produce candidates for `root` into `out` until exhausted or
    /// canceled. An error terminates this method only; the pipeline keeps
    /// the other producers running.
    async fn run(
        &self,
        cancel: CancellationToken,
        root: &str,
        out: mpsc::Sender<Candidate>,
    ) -> anyhow::Result<()>;
}

/// Keep candidates that are syntactically plausible hostnames under `root`.
pub(crate) fn is_candidate_under_root(name: &str, root: &str) -> bool {
    let name = name.trim_end_matches('.');
    if name.is_empty() || name.len() > 253 || name.contains('*') {
        return false;
    }
    let suffix = format!(".{root}");
    if !name.to_ascii_lowercase().ends_with(&suffix.to_ascii_lowercase()) {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_subdomains() {
        assert!(is_candidate_under_root("www.example.com", "example.com"));
        assert!(is_candidate_under_root("a.b.example.com", "example.com"));
        assert!(is_candidate_under_root("WWW.Example.COM", "example.com"));
    }

    #[test]
    fn rejects_foreign_and_malformed_names() {
        assert!(!is_candidate_under_root("example.com", "example.com"));
        assert!(!is_candidate_under_root("www.example.org", "example.com"));
        assert!(!is_candidate_under_root("*.example.com", "example.com"));
        assert!(!is_candidate_under_root("bad..example.com", "example.com"));
        assert!(!is_candidate_under_root("", "example.com"));
        assert!(!is_candidate_under_root("notexample.com", "example.com"));
    }
}
