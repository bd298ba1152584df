//! Zone-transfer method: attempts AXFR against the root's authoritative
//! name servers. Almost always refused in the wild; when a server is
//! misconfigured the whole zone comes back at once.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_client::client::{AsyncClient, ClientHandle};
use hickory_proto::iocompat::AsyncIoTokioAsStd;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use hickory_proto::tcp::TcpClientStream;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::resolve::{DnsRecordType, ResolverPool};

use super::{Candidate, EnumMethod, is_candidate_under_root};

pub const METHOD_NAME: &str = "dns_zone_transfer";

/// Attempts AXFR on each authoritative NS of the root.
pub struct ZoneTransfer {
    resolver: Arc<ResolverPool>,
}

impl ZoneTransfer {
    pub fn new(resolver: Arc<ResolverPool>) -> Self {
        Self { resolver }
    }

    async fn transfer_from(&self, ns_addr: SocketAddr, root: &str) -> anyhow::Result<Vec<String>> {
        let (stream, sender) =
            TcpClientStream::<AsyncIoTokioAsStd<TcpStream>>::new(ns_addr);
        let (mut client, background) = AsyncClient::new(stream, sender, None).await?;
        tokio::spawn(background);

        let zone = Name::from_str(&format!("{root}."))?;
        let response = client.query(zone, DNSClass::IN, RecordType::AXFR).await?;

        let names = response
            .answers()
            .iter()
            .map(|record| record.name().to_string().trim_end_matches('.').to_owned())
            .collect();
        Ok(names)
    }
}

#[async_trait]
impl EnumMethod for ZoneTransfer {
    fn name(&self) -> &str {
        METHOD_NAME
    }

    async fn run(
        &self,
        cancel: CancellationToken,
        root: &str,
        out: mpsc::Sender<Candidate>,
    ) -> anyhow::Result<()> {
        let ns_records = self.resolver.resolve(root, DnsRecordType::Ns).await?;
        if ns_records.is_empty() {
            anyhow::bail!("no authoritative name servers found for {root}");
        }

        let mut last_err: Option<anyhow::Error> = None;
        let mut transferred = false;

        for ns in &ns_records {
            if cancel.is_cancelled() {
                return Ok(());
            }
            // Resolve the NS host to an address we can open TCP/53 to.
            let addrs = match self.resolver.resolve(&ns.value, DnsRecordType::A).await {
                Ok(records) => records,
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            };
            let Some(ip) = addrs.iter().find(|r| r.record_type == "A") else {
                continue;
            };
            let Ok(addr) = format!("{}:53", ip.value).parse::<SocketAddr>() else {
                continue;
            };

            let names = tokio::select! {
                r = self.transfer_from(addr, root) => r,
                _ = cancel.cancelled() => return Ok(()),
            };

            match names {
                Ok(names) => {
                    transferred = true;
                    for name in names {
                        if !is_candidate_under_root(&name, root) {
                            continue;
                        }
                        let candidate = Candidate {
                            name,
                            source: METHOD_NAME.to_owned(),
                        };
                        if out.send(candidate).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(ns = %ns.value, error = %e, "zone transfer refused");
                    last_err = Some(e);
                }
            }
        }

        // Refusals everywhere are the normal case and count as failure:
        // this method contributed nothing.
        match (transferred, last_err) {
            (false, Some(e)) => Err(e),
            (false, None) => anyhow::bail!("no name server allowed a transfer for {root}"),
            _ => Ok(()),
        }
    }
}
