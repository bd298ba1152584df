//! Passive-sources method: third-party host-search APIs.
//!
//! Endpoints are URL templates with a `{domain}` placeholder. Responses are
//! accepted either as a JSON array of hostnames or as line-oriented text
//! whose first comma-separated field is the hostname (the common CSV shape
//! of host-search services).

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Candidate, EnumMethod, is_candidate_under_root};

pub const METHOD_NAME: &str = "passive_sources";

/// Queries a configured list of passive data sources.
pub struct PassiveSources {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl PassiveSources {
    pub fn new(client: reqwest::Client, endpoints: Vec<String>) -> Self {
        Self { client, endpoints }
    }
}

fn extract_hosts(body: &str) -> Vec<String> {
    if let Ok(names) = serde_json::from_str::<Vec<String>>(body) {
        return names;
    }
    body.lines()
        .filter_map(|line| line.split(',').next())
        .map(|host| host.trim().to_owned())
        .filter(|host| !host.is_empty())
        .collect()
}

#[async_trait]
impl EnumMethod for PassiveSources {
    fn name(&self) -> &str {
        METHOD_NAME
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        root: &str,
        out: mpsc::Sender<Candidate>,
    ) -> anyhow::Result<()> {
        let mut last_err: Option<anyhow::Error> = None;
        let mut any_ok = false;

        for template in &self.endpoints {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let url = template.replace("{domain}", root);

            let body = async {
                let response = self.client.get(&url).send().await?;
                anyhow::Ok(response.error_for_status()?.text().await?)
            }
            .await;

            let body = match body {
                Ok(body) => {
                    any_ok = true;
                    body
                }
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "passive source failed");
                    last_err = Some(e);
                    continue;
                }
            };

            for host in extract_hosts(&body) {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                if !is_candidate_under_root(&host, root) {
                    continue;
                }
                let candidate = Candidate {
                    name: host,
                    source: METHOD_NAME.to_owned(),
                };
                if out.send(candidate).await.is_err() {
                    return Ok(());
                }
            }
        }

        // The method fails only when every source failed.
        match (any_ok, last_err) {
            (false, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }
}
