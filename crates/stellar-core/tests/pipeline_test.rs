//! Integration tests for the subdomain enumeration pipeline, driven by a
//! scripted DNS endpoint so no network is involved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use stellar_core::enumerate::methods::{Candidate, EnumMethod};
use stellar_core::enumerate::{
    self, DnsBrute, EnumerationConfig, EnumerationRun, TakeoverChecker,
};
use stellar_core::error::Error;
use stellar_core::resolve::{
    DnsError, DnsRecordType, Lookup, ResolverPool, ResolverPoolConfig,
};
use stellar_db::models::DnsRecordData;
use stellar_test_utils::fixtures::takeover_rule;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// A DNS endpoint answering from a fixed table, with a default for
/// everything else (random wildcard probes land on the default).
struct FakeDns {
    answers: HashMap<String, Vec<DnsRecordData>>,
    fallback: Result<Vec<DnsRecordData>, DnsError>,
}

impl FakeDns {
    fn nxdomain_by_default() -> Self {
        Self {
            answers: HashMap::new(),
            fallback: Err(DnsError::Nxdomain),
        }
    }

    fn wildcard(ip: &str) -> Self {
        Self {
            answers: HashMap::new(),
            fallback: Ok(vec![a_record(ip)]),
        }
    }

    fn answer(mut self, name: &str, records: Vec<DnsRecordData>) -> Self {
        self.answers.insert(name.to_owned(), records);
        self
    }
}

#[async_trait]
impl Lookup for FakeDns {
    async fn lookup(
        &self,
        name: &str,
        _rtype: DnsRecordType,
    ) -> Result<Vec<DnsRecordData>, DnsError> {
        match self.answers.get(name) {
            Some(records) => Ok(records.clone()),
            None => self.fallback.clone(),
        }
    }
}

fn a_record(ip: &str) -> DnsRecordData {
    DnsRecordData {
        record_type: "A".into(),
        value: ip.into(),
        ttl: 300,
    }
}

fn cname_record(target: &str) -> DnsRecordData {
    DnsRecordData {
        record_type: "CNAME".into(),
        value: target.into(),
        ttl: 300,
    }
}

fn pool_over(dns: FakeDns) -> Arc<ResolverPool> {
    Arc::new(ResolverPool::new(
        vec![Arc::new(dns) as Arc<dyn Lookup>],
        ResolverPoolConfig {
            retries: 0,
            timeout: Duration::from_secs(1),
            rate_limit_per_sec: 100_000,
        },
    ))
}

/// A method emitting a fixed candidate list under a custom name.
struct ListMethod {
    method_name: String,
    names: Vec<String>,
}

impl ListMethod {
    fn new(method_name: &str, names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            method_name: method_name.to_owned(),
            names: names.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[async_trait]
impl EnumMethod for ListMethod {
    fn name(&self) -> &str {
        &self.method_name
    }

    async fn run(
        &self,
        _cancel: CancellationToken,
        _root: &str,
        out: mpsc::Sender<Candidate>,
    ) -> anyhow::Result<()> {
        for name in &self.names {
            if out
                .send(Candidate {
                    name: name.clone(),
                    source: self.method_name.clone(),
                })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// A method that always errors.
struct BrokenMethod;

#[async_trait]
impl EnumMethod for BrokenMethod {
    fn name(&self) -> &str {
        "broken"
    }

    async fn run(
        &self,
        _cancel: CancellationToken,
        _root: &str,
        _out: mpsc::Sender<Candidate>,
    ) -> anyhow::Result<()> {
        anyhow::bail!("upstream api returned 500")
    }
}

async fn drain(mut run: EnumerationRun) -> (Vec<enumerate::EnumeratedSubdomain>, f64, enumerate::EnumerationSummary) {
    let mut results = Vec::new();
    while let Some(r) = run.results.recv().await {
        results.push(r);
    }
    let summary = run.done.await.unwrap().unwrap();
    let progress = *run.progress.borrow();
    (results, progress, summary)
}

fn small_config(root: &str) -> EnumerationConfig {
    let mut config = EnumerationConfig::new(root);
    config.concurrency = 2;
    config.progress_interval = Duration::from_millis(1);
    config
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_emits_resolved_names_only() {
    let dns = FakeDns::nxdomain_by_default()
        .answer("www.example.com", vec![a_record("93.184.216.34")])
        .answer("mail.example.com", vec![a_record("93.184.216.35")]);
    let resolver = pool_over(dns);

    let brute = Arc::new(DnsBrute::new(vec!["www".into(), "mail".into(), "nope".into()]));
    let run = enumerate::start(
        small_config("example.com"),
        resolver,
        Arc::new(TakeoverChecker::empty()),
        vec![brute],
        CancellationToken::new(),
    );

    let (results, progress, summary) = drain(run).await;

    let mut names: Vec<&str> = results.iter().map(|r| r.subdomain.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["mail.example.com", "www.example.com"]);
    assert!(results.iter().all(|r| r.is_resolved && !r.is_wildcard));
    assert_eq!(progress, 1.0);
    assert_eq!(summary.total_found, 2);
    assert_eq!(summary.resolved_count, 2);
    assert_eq!(summary.wildcard_count, 0);
    assert!(!summary.canceled);
}

#[tokio::test]
async fn wildcard_zone_filters_everything() {
    // Every label under wild.test resolves to the same address, including
    // the random probes.
    let resolver = pool_over(FakeDns::wildcard("1.2.3.4"));

    let brute = Arc::new(DnsBrute::new(vec!["a".into(), "b".into(), "c".into()]));
    let run = enumerate::start(
        small_config("wild.test"),
        resolver,
        Arc::new(TakeoverChecker::empty()),
        vec![brute],
        CancellationToken::new(),
    );

    let (results, progress, summary) = drain(run).await;

    assert!(results.is_empty(), "wildcard matches must be filtered");
    assert_eq!(progress, 1.0);
    assert_eq!(summary.wildcard_count, 3);
    assert_eq!(summary.total_found, 0);
    assert!(summary.wildcard_detected);
}

#[tokio::test]
async fn wildcard_results_kept_when_configured() {
    let resolver = pool_over(FakeDns::wildcard("1.2.3.4"));

    let mut config = small_config("wild.test");
    config.include_wildcards = true;

    let brute = Arc::new(DnsBrute::new(vec!["a".into(), "b".into()]));
    let run = enumerate::start(
        config,
        resolver,
        Arc::new(TakeoverChecker::empty()),
        vec![brute],
        CancellationToken::new(),
    );

    let (results, _, summary) = drain(run).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_wildcard));
    assert_eq!(summary.wildcard_count, 2);
}

#[tokio::test]
async fn duplicate_candidates_emit_once_with_merged_sources() {
    let dns = FakeDns::nxdomain_by_default()
        .answer("www.example.com", vec![a_record("10.0.0.1")]);
    let resolver = pool_over(dns);

    // Two methods both surface www (one with different casing), plus one
    // method-local duplicate.
    let first = ListMethod::new("alpha", &["www.example.com", "WWW.Example.Com"]);
    let second = ListMethod::new("beta", &["www.example.com"]);

    let run = enumerate::start(
        small_config("example.com"),
        resolver,
        Arc::new(TakeoverChecker::empty()),
        vec![first, second],
        CancellationToken::new(),
    );

    let (results, _, summary) = drain(run).await;

    assert_eq!(results.len(), 1, "case-insensitive dedup must emit once");
    assert_eq!(results[0].subdomain, "www.example.com");
    assert_eq!(summary.total_found, 1);
    // Candidate counters still see every observation.
    assert_eq!(summary.method_stats["alpha"].candidates, 2);
    assert_eq!(summary.method_stats["beta"].candidates, 1);
}

#[tokio::test]
async fn takeover_cname_is_flagged() {
    let dns = FakeDns::nxdomain_by_default().answer(
        "shop.example.com",
        vec![cname_record("org.github.io"), a_record("185.199.108.153")],
    );
    let resolver = pool_over(dns);

    let checker =
        TakeoverChecker::from_rules(vec![takeover_rule("github-pages", "github.io")]).unwrap();

    let brute = Arc::new(DnsBrute::new(vec!["shop".into()]));
    let run = enumerate::start(
        small_config("example.com"),
        resolver,
        Arc::new(checker),
        vec![brute],
        CancellationToken::new(),
    );

    let (results, _, summary) = drain(run).await;

    assert_eq!(results.len(), 1);
    assert!(results[0].is_takeover);
    assert_eq!(results[0].takeover_kind.as_deref(), Some("github-pages"));
    assert_eq!(results[0].cname.as_deref(), Some("org.github.io"));
    assert_eq!(summary.takeover_count, 1);
}

#[tokio::test]
async fn one_broken_method_does_not_sink_the_run() {
    let dns = FakeDns::nxdomain_by_default()
        .answer("www.example.com", vec![a_record("10.0.0.1")]);
    let resolver = pool_over(dns);

    let run = enumerate::start(
        small_config("example.com"),
        resolver,
        Arc::new(TakeoverChecker::empty()),
        vec![
            Arc::new(BrokenMethod),
            Arc::new(DnsBrute::new(vec!["www".into()])),
        ],
        CancellationToken::new(),
    );

    let (results, _, summary) = drain(run).await;

    assert_eq!(results.len(), 1);
    assert!(summary.method_stats["broken"].failed);
    assert!(!summary.method_stats["dns_brute"].failed);
}

#[tokio::test]
async fn all_methods_failing_fails_the_run() {
    let resolver = pool_over(FakeDns::nxdomain_by_default());

    let mut run = enumerate::start(
        small_config("example.com"),
        resolver,
        Arc::new(TakeoverChecker::empty()),
        vec![Arc::new(BrokenMethod) as Arc<dyn EnumMethod>],
        CancellationToken::new(),
    );

    assert!(run.results.recv().await.is_none());
    let err = run.done.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Transient(_)), "got {err:?}");
}

#[tokio::test]
async fn cancellation_closes_streams_and_reports_canceled() {
    // Plenty of resolvable candidates so the run would not finish on its
    // own before the cancel lands.
    let resolver = pool_over(FakeDns::wildcard("10.9.8.7"));

    let words: Vec<String> = (0..5_000).map(|i| format!("host{i}")).collect();
    let mut config = small_config("example.com");
    config.include_wildcards = true;
    config.wildcard_probes = 0;

    let cancel = CancellationToken::new();
    let mut run = enumerate::start(
        config,
        resolver,
        Arc::new(TakeoverChecker::empty()),
        vec![Arc::new(DnsBrute::new(words)) as Arc<dyn EnumMethod>],
        cancel.clone(),
    );

    // Take one result, then cancel.
    let first = run.results.recv().await;
    assert!(first.is_some());
    cancel.cancel();

    // The stream must close (drain whatever was already in flight).
    while run.results.recv().await.is_some() {}

    let summary = run.done.await.unwrap().unwrap();
    assert!(summary.canceled, "cancellation must not read as failure");
}

#[tokio::test]
async fn empty_method_set_is_a_validation_error() {
    let resolver = pool_over(FakeDns::nxdomain_by_default());
    let run = enumerate::start(
        small_config("example.com"),
        resolver,
        Arc::new(TakeoverChecker::empty()),
        vec![],
        CancellationToken::new(),
    );
    let err = run.done.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn bad_root_domain_is_rejected() {
    let resolver = pool_over(FakeDns::nxdomain_by_default());
    let run = enumerate::start(
        small_config("not-a-domain"),
        resolver,
        Arc::new(TakeoverChecker::empty()),
        vec![Arc::new(DnsBrute::new(vec!["www".into()])) as Arc<dyn EnumMethod>],
        CancellationToken::new(),
    );
    let err = run.done.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
