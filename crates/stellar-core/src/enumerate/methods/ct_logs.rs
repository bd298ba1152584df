//! Certificate-transparency method: queries a CT log aggregator for
//! certificates issued under the root and extracts their DNS names.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Candidate, EnumMethod, is_candidate_under_root};

pub const METHOD_NAME: &str = "cert_transparency";

/// One aggregator row; `name_value` may hold several newline-separated names.
#[derive(Debug, Deserialize)]
struct CtEntry {
    name_value: String,
}

/// Queries a crt.sh-compatible aggregator.
pub struct CertTransparency {
    client: reqwest::Client,
    base_url: String,
}

impl CertTransparency {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, "https://crt.sh")
    }

    /// Override the aggregator endpoint (tests point this at a local server).
    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl EnumMethod for CertTransparency {
    fn name(&self) -> &str {
        METHOD_NAME
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        root: &str,
        out: mpsc::Sender<Candidate>,
    ) -> anyhow::Result<()> {
        let url = format!("{}/?q=%25.{root}&output=json", self.base_url);

        let response = tokio::select! {
            r = self.client.get(&url).send() => r?,
            _ = cancel.cancelled() => return Ok(()),
        };
        let entries: Vec<CtEntry> = response.error_for_status()?.json().await?;

        for entry in entries {
            for name in entry.name_value.lines() {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                let name = name.trim();
                // Wildcard SANs are certificates, not hosts.
                let name = name.strip_prefix("*.").unwrap_or(name);
                if !is_candidate_under_root(name, root) {
                    continue;
                }
                let candidate = Candidate {
                    name: name.to_owned(),
                    source: METHOD_NAME.to_owned(),
                };
                if out.send(candidate).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}
