//! The DNS resolver pool.
//!
//! A bounded set of resolver endpoints consumed round-robin, behind a
//! shared token-bucket rate limit. Each call carries a deadline; transient
//! classes are retried, nxdomain is a definitive negative and never is.

mod rate_limit;

pub use rate_limit::TokenBucket;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind as HickoryErrorKind};
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::proto::rr::RecordType;

use stellar_db::models::DnsRecordData;

/// DNS record types the pool can query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsRecordType {
    A,
    Aaaa,
    Cname,
    Ns,
    Txt,
}

impl DnsRecordType {
    fn to_hickory(self) -> RecordType {
        match self {
            Self::A => RecordType::A,
            Self::Aaaa => RecordType::AAAA,
            Self::Cname => RecordType::CNAME,
            Self::Ns => RecordType::NS,
            Self::Txt => RecordType::TXT,
        }
    }
}

impl fmt::Display for DnsRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
            Self::Cname => "CNAME",
            Self::Ns => "NS",
            Self::Txt => "TXT",
        };
        f.write_str(s)
    }
}

/// Classified resolution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DnsError {
    /// Definitive negative answer. Never retried.
    #[error("nxdomain")]
    Nxdomain,
    #[error("servfail")]
    Servfail,
    #[error("query timed out")]
    Timeout,
    /// The resolver refused the query. Surfaced without retry.
    #[error("refused")]
    Refused,
    /// Connection or protocol trouble worth another attempt.
    #[error("transient resolver error")]
    Transient,
}

impl DnsError {
    /// Whether the pool may retry on another endpoint.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Servfail | Self::Timeout | Self::Transient)
    }
}

/// One resolver endpoint. The trait seam lets tests substitute scripted
/// lookups for real network resolvers.
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn lookup(&self, name: &str, rtype: DnsRecordType)
    -> Result<Vec<DnsRecordData>, DnsError>;
}

/// A hickory-backed endpoint querying one upstream server over UDP.
pub struct HickoryEndpoint {
    resolver: TokioAsyncResolver,
}

impl HickoryEndpoint {
    pub fn new(upstream: SocketAddr, timeout: Duration) -> Self {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(upstream, Protocol::Udp));
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;
        opts.attempts = 1; // the pool owns retry, not the transport
        opts.cache_size = 0;
        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

#[async_trait]
impl Lookup for HickoryEndpoint {
    async fn lookup(
        &self,
        name: &str,
        rtype: DnsRecordType,
    ) -> Result<Vec<DnsRecordData>, DnsError> {
        let lookup = self
            .resolver
            .lookup(name, rtype.to_hickory())
            .await
            .map_err(classify)?;

        let records = lookup
            .record_iter()
            .filter_map(|record| {
                let data = record.data()?;
                let mut value = data.to_string();
                // Names come back fully qualified; store them bare.
                if matches!(rtype, DnsRecordType::Cname | DnsRecordType::Ns) {
                    value = value.trim_end_matches('.').to_string();
                }
                Some(DnsRecordData {
                    record_type: record.record_type().to_string(),
                    value,
                    ttl: record.ttl(),
                })
            })
            .collect();

        Ok(records)
    }
}

fn classify(err: ResolveError) -> DnsError {
    match err.kind() {
        HickoryErrorKind::NoRecordsFound { response_code, .. } => match response_code {
            ResponseCode::NXDomain => DnsError::Nxdomain,
            ResponseCode::ServFail => DnsError::Servfail,
            ResponseCode::Refused => DnsError::Refused,
            // NoError with an empty answer section is a definitive miss.
            ResponseCode::NoError => DnsError::Nxdomain,
            _ => DnsError::Transient,
        },
        HickoryErrorKind::Timeout => DnsError::Timeout,
        _ => DnsError::Transient,
    }
}

/// Resolver pool configuration.
#[derive(Debug, Clone)]
pub struct ResolverPoolConfig {
    /// Retries on retryable classes, per call.
    pub retries: u32,
    /// Per-call deadline, applied on top of the transport timeout.
    pub timeout: Duration,
    /// Global queries-per-second budget shared across all callers.
    pub rate_limit_per_sec: u32,
}

impl Default for ResolverPoolConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout: Duration::from_secs(5),
            rate_limit_per_sec: 100,
        }
    }
}

/// The resolver pool: round-robin rotation over endpoints, shared rate
/// limit, bounded retry.
pub struct ResolverPool {
    endpoints: Vec<Arc<dyn Lookup>>,
    next: AtomicUsize,
    bucket: TokenBucket,
    config: ResolverPoolConfig,
}

impl ResolverPool {
    /// Build a pool over explicit endpoints (tests use scripted ones).
    pub fn new(endpoints: Vec<Arc<dyn Lookup>>, config: ResolverPoolConfig) -> Self {
        assert!(!endpoints.is_empty(), "resolver pool needs at least one endpoint");
        Self {
            endpoints,
            next: AtomicUsize::new(0),
            bucket: TokenBucket::new(config.rate_limit_per_sec),
            config,
        }
    }

    /// Build a pool over upstream DNS servers.
    pub fn from_upstreams(upstreams: &[SocketAddr], config: ResolverPoolConfig) -> Self {
        let endpoints: Vec<Arc<dyn Lookup>> = upstreams
            .iter()
            .map(|addr| {
                Arc::new(HickoryEndpoint::new(*addr, config.timeout)) as Arc<dyn Lookup>
            })
            .collect();
        Self::new(endpoints, config)
    }

    fn rotate(&self) -> &Arc<dyn Lookup> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[i]
    }

    /// Resolve `name` for `rtype`.
    ///
    /// Rotates endpoints, enforces the shared rate limit and per-call
    /// deadline, and retries only retryable classes. Nxdomain and refused
    /// answers return immediately.
    pub async fn resolve(
        &self,
        name: &str,
        rtype: DnsRecordType,
    ) -> Result<Vec<DnsRecordData>, DnsError> {
        let mut last = DnsError::Transient;
        for _attempt in 0..=self.config.retries {
            self.bucket.acquire().await;
            let endpoint = self.rotate();

            let outcome =
                tokio::time::timeout(self.config.timeout, endpoint.lookup(name, rtype)).await;

            match outcome {
                Ok(Ok(records)) => return Ok(records),
                Ok(Err(err)) if !err.is_retryable() => return Err(err),
                Ok(Err(err)) => last = err,
                Err(_) => last = DnsError::Timeout,
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    /// Endpoint returning a fixed script of outcomes.
    struct Scripted {
        calls: AtomicU32,
        script: Vec<Result<Vec<DnsRecordData>, DnsError>>,
    }

    impl Scripted {
        fn new(script: Vec<Result<Vec<DnsRecordData>, DnsError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script,
            })
        }
    }

    #[async_trait]
    impl Lookup for Scripted {
        async fn lookup(
            &self,
            _name: &str,
            _rtype: DnsRecordType,
        ) -> Result<Vec<DnsRecordData>, DnsError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            self.script
                .get(i.min(self.script.len() - 1))
                .cloned()
                .unwrap()
        }
    }

    fn a_record(ip: &str) -> DnsRecordData {
        DnsRecordData {
            record_type: "A".into(),
            value: ip.into(),
            ttl: 300,
        }
    }

    fn test_config() -> ResolverPoolConfig {
        ResolverPoolConfig {
            retries: 3,
            timeout: Duration::from_secs(1),
            rate_limit_per_sec: 10_000,
        }
    }

    fn pool_of(endpoints: &[Arc<Scripted>]) -> ResolverPool {
        let eps: Vec<Arc<dyn Lookup>> = endpoints
            .iter()
            .map(|e| Arc::clone(e) as Arc<dyn Lookup>)
            .collect();
        ResolverPool::new(eps, test_config())
    }

    #[tokio::test]
    async fn success_passes_through() {
        let ep = Scripted::new(vec![Ok(vec![a_record("1.2.3.4")])]);
        let pool = pool_of(&[ep]);
        let records = pool.resolve("www.example.com", DnsRecordType::A).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, "1.2.3.4");
    }

    #[tokio::test]
    async fn nxdomain_is_definitive_and_never_retried() {
        let ep = Scripted::new(vec![Err(DnsError::Nxdomain), Ok(vec![a_record("1.2.3.4")])]);
        let pool = pool_of(&[ep.clone()]);
        let err = pool
            .resolve("nope.example.com", DnsRecordType::A)
            .await
            .unwrap_err();
        assert_eq!(err, DnsError::Nxdomain);
        assert_eq!(ep.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_retry_until_success() {
        let ep = Scripted::new(vec![
            Err(DnsError::Transient),
            Err(DnsError::Servfail),
            Ok(vec![a_record("5.6.7.8")]),
        ]);
        let pool = pool_of(&[ep.clone()]);
        let records = pool.resolve("www.example.com", DnsRecordType::A).await.unwrap();
        assert_eq!(records[0].value, "5.6.7.8");
        assert_eq!(ep.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_budget_is_bounded() {
        let ep = Scripted::new(vec![Err(DnsError::Timeout)]);
        let pool = pool_of(&[ep.clone()]);
        let err = pool
            .resolve("www.example.com", DnsRecordType::A)
            .await
            .unwrap_err();
        assert_eq!(err, DnsError::Timeout);
        // initial attempt + 3 retries
        assert_eq!(ep.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn refused_is_not_retried() {
        let ep = Scripted::new(vec![Err(DnsError::Refused)]);
        let pool = pool_of(&[ep.clone()]);
        let err = pool
            .resolve("www.example.com", DnsRecordType::A)
            .await
            .unwrap_err();
        assert_eq!(err, DnsError::Refused);
        assert_eq!(ep.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rotation_spreads_across_endpoints() {
        let a = Scripted::new(vec![Ok(vec![a_record("1.1.1.1")])]);
        let b = Scripted::new(vec![Ok(vec![a_record("2.2.2.2")])]);
        let pool = pool_of(&[a.clone(), b.clone()]);
        for _ in 0..4 {
            pool.resolve("www.example.com", DnsRecordType::A).await.unwrap();
        }
        assert_eq!(a.calls.load(Ordering::SeqCst), 2);
        assert_eq!(b.calls.load(Ordering::SeqCst), 2);
    }
}
