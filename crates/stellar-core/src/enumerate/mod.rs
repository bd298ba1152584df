//! The subdomain enumeration pipeline.
//!
//! Fans the configured methods out as parallel candidate producers, funnels
//! them through a case-insensitive dedup stage into a bounded worker pool
//! that resolves each candidate, applies wildcard filtering and take-over
//! checks, and emits unique results onto a finite stream. Progress is
//! published on a watch channel, capped below 1.0 until completion.

pub mod methods;
pub mod takeover;
pub mod wildcard;

pub use methods::{
    Candidate, CertTransparency, DnsBrute, EnumMethod, PassiveSources, ZoneTransfer,
};
pub use takeover::TakeoverChecker;
pub use wildcard::WildcardFingerprint;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use stellar_db::models::DnsRecordData;

use crate::error::{Error, Result};
use crate::protocol::MethodStats;
use crate::resolve::{DnsError, DnsRecordType, ResolverPool};

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct EnumerationConfig {
    pub root_domain: String,
    /// Size of the resolving worker pool.
    pub concurrency: usize,
    /// Emit wildcard-matching results instead of filtering them.
    pub include_wildcards: bool,
    /// Random labels probed for wildcard detection (0 disables).
    pub wildcard_probes: usize,
    /// Confirm take-over matches by fetching the host and testing the
    /// rule's body pattern.
    pub verify_takeover_http: bool,
    /// Buffer size for the candidate and result channels.
    pub channel_buffer: usize,
    /// Minimum interval between progress publications.
    pub progress_interval: Duration,
}

impl EnumerationConfig {
    pub fn new(root_domain: impl Into<String>) -> Self {
        Self {
            root_domain: root_domain.into(),
            concurrency: 50,
            include_wildcards: false,
            wildcard_probes: 3,
            verify_takeover_http: false,
            channel_buffer: 1024,
            progress_interval: Duration::from_secs(1),
        }
    }
}

/// One unique, resolved subdomain emitted on the result stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedSubdomain {
    pub subdomain: String,
    pub root_domain: String,
    pub ips: Vec<String>,
    pub cname: Option<String>,
    pub record_type: String,
    pub records: Vec<DnsRecordData>,
    pub is_wildcard: bool,
    pub is_resolved: bool,
    pub is_takeover: bool,
    pub takeover_kind: Option<String>,
    pub sources: Vec<String>,
}

/// Final accounting for a pipeline run.
#[derive(Debug, Clone, Default)]
pub struct EnumerationSummary {
    pub total_found: u64,
    pub resolved_count: u64,
    pub wildcard_count: u64,
    pub takeover_count: u64,
    pub method_stats: HashMap<String, MethodStats>,
    pub wildcard_detected: bool,
    /// True when the run was terminated by cancellation rather than
    /// exhaustion.
    pub canceled: bool,
}

/// Handles to a started pipeline: the lazy finite result stream, the
/// progress stream, and the completion future.
pub struct EnumerationRun {
    pub results: mpsc::Receiver<EnumeratedSubdomain>,
    pub progress: watch::Receiver<f64>,
    pub done: JoinHandle<Result<EnumerationSummary>>,
}

/// Start the pipeline. Both streams close when the run finishes; canceling
/// `cancel` terminates in-flight work and closes them early.
pub fn start(
    config: EnumerationConfig,
    resolver: Arc<ResolverPool>,
    takeover: Arc<TakeoverChecker>,
    methods: Vec<Arc<dyn EnumMethod>>,
    cancel: CancellationToken,
) -> EnumerationRun {
    let (result_tx, result_rx) = mpsc::channel(config.channel_buffer.max(1));
    let (progress_tx, progress_rx) = watch::channel(0.0);

    let done = tokio::spawn(run_pipeline(
        config,
        resolver,
        takeover,
        methods,
        cancel,
        result_tx,
        progress_tx,
    ));

    EnumerationRun {
        results: result_rx,
        progress: progress_rx,
        done,
    }
}

/// Shared state threaded through producers and workers.
struct Shared {
    config: EnumerationConfig,
    resolver: Arc<ResolverPool>,
    takeover: Arc<TakeoverChecker>,
    cancel: CancellationToken,
    http: reqwest::Client,
    wildcard: RwLock<Option<WildcardFingerprint>>,
    /// Discovery sources for candidates not yet emitted. An entry is
    /// removed at emission time; merges after that are no-ops because
    /// stream elements are immutable once sent.
    pending_sources: Mutex<HashMap<String, Vec<String>>>,
    /// Emitted-result counts per contributing method.
    result_counts: Mutex<HashMap<String, u64>>,
    processed: AtomicU64,
    estimated: AtomicU64,
    resolved: AtomicU64,
    wildcards: AtomicU64,
    takeovers: AtomicU64,
    found: AtomicU64,
    progress_tx: watch::Sender<f64>,
    last_progress: Mutex<Instant>,
}

impl Shared {
    /// Publish `processed / estimated` (capped at 0.99) at most once per
    /// configured interval.
    fn publish_progress(&self) {
        let processed = self.processed.load(Ordering::Relaxed);
        let estimated = self.estimated.load(Ordering::Relaxed).max(1);
        let value = (processed as f64 / estimated as f64).min(0.99);

        let mut last = self.last_progress.lock().expect("progress clock poisoned");
        if last.elapsed() < self.config.progress_interval {
            return;
        }
        let modified = self.progress_tx.send_if_modified(|current| {
            if (*current - value).abs() > f64::EPSILON {
                *current = value;
                true
            } else {
                false
            }
        });
        if modified {
            *last = Instant::now();
        }
    }
}

async fn run_pipeline(
    config: EnumerationConfig,
    resolver: Arc<ResolverPool>,
    takeover: Arc<TakeoverChecker>,
    methods: Vec<Arc<dyn EnumMethod>>,
    cancel: CancellationToken,
    result_tx: mpsc::Sender<EnumeratedSubdomain>,
    progress_tx: watch::Sender<f64>,
) -> Result<EnumerationSummary> {
    let root = config.root_domain.trim().trim_end_matches('.').to_lowercase();
    if root.is_empty() || !root.contains('.') {
        return Err(Error::Validation(format!(
            "invalid root domain {:?}",
            config.root_domain
        )));
    }
    if methods.is_empty() {
        return Err(Error::Validation(
            "at least one enumeration method is required".into(),
        ));
    }

    // Wildcard probe before any candidates resolve.
    let fingerprint = if config.wildcard_probes > 0 {
        wildcard::detect(&resolver, &root, config.wildcard_probes).await
    } else {
        None
    };
    if let Some(fp) = &fingerprint {
        tracing::info!(root = %root, ips = ?fp.ips, "wildcard zone detected");
    }
    let wildcard_detected = fingerprint.is_some();

    let shared = Arc::new(Shared {
        resolver,
        takeover,
        cancel: cancel.clone(),
        http: reqwest::Client::new(),
        wildcard: RwLock::new(fingerprint),
        pending_sources: Mutex::new(HashMap::new()),
        result_counts: Mutex::new(HashMap::new()),
        processed: AtomicU64::new(0),
        estimated: AtomicU64::new(0),
        resolved: AtomicU64::new(0),
        wildcards: AtomicU64::new(0),
        takeovers: AtomicU64::new(0),
        found: AtomicU64::new(0),
        progress_tx,
        last_progress: Mutex::new(Instant::now()),
        config,
    });

    // Fan the methods out as producers.
    let (cand_tx, mut cand_rx) = mpsc::channel::<Candidate>(shared.config.channel_buffer.max(1));
    let mut method_stats: HashMap<String, MethodStats> = HashMap::new();
    let mut producers: JoinSet<(String, bool)> = JoinSet::new();

    for method in methods {
        method_stats.insert(method.name().to_owned(), MethodStats::default());
        if let Some(estimate) = method.estimate() {
            shared.estimated.fetch_add(estimate, Ordering::Relaxed);
        }
        let tx = cand_tx.clone();
        let method_cancel = cancel.clone();
        let method_root = root.clone();
        producers.spawn(async move {
            let name = method.name().to_owned();
            match method.run(method_cancel, &method_root, tx).await {
                Ok(()) => (name, false),
                Err(e) => {
                    tracing::warn!(method = %name, error = %e, "enumeration method failed");
                    (name, true)
                }
            }
        });
    }
    drop(cand_tx);

    // Dedup stage feeding a bounded worker pool.
    let semaphore = Arc::new(Semaphore::new(shared.config.concurrency.max(1)));
    let mut workers: JoinSet<()> = JoinSet::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut canceled = false;

    loop {
        let candidate = tokio::select! {
            c = cand_rx.recv() => c,
            _ = cancel.cancelled() => {
                canceled = true;
                break;
            }
        };
        let Some(candidate) = candidate else { break };

        if let Some(stats) = method_stats.get_mut(&candidate.source) {
            stats.candidates += 1;
        }

        let key = candidate.name.trim_end_matches('.').to_lowercase();
        if !methods::is_candidate_under_root(&key, &root) {
            continue;
        }

        if !seen.insert(key.clone()) {
            // Duplicate: merge the source while the first observation is
            // still in flight. First observation wins; no second emission.
            let mut pending = shared
                .pending_sources
                .lock()
                .expect("pending sources poisoned");
            if let Some(sources) = pending.get_mut(&key) {
                if !sources.contains(&candidate.source) {
                    sources.push(candidate.source.clone());
                }
            }
            continue;
        }

        shared
            .pending_sources
            .lock()
            .expect("pending sources poisoned")
            .insert(key.clone(), vec![candidate.source.clone()]);
        shared
            .estimated
            .fetch_max(seen.len() as u64, Ordering::Relaxed);

        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("worker semaphore closed");
        let worker_shared = Arc::clone(&shared);
        let worker_root = root.clone();
        let tx = result_tx.clone();
        workers.spawn(async move {
            process_candidate(worker_shared, worker_root, key, tx).await;
            drop(permit);
        });
    }

    if canceled {
        // Terminate in-flight work; the streams close when the senders drop.
        workers.shutdown().await;
        producers.shutdown().await;
    } else {
        while workers.join_next().await.is_some() {}
    }

    // Collect per-method outcomes.
    let mut failed_methods = 0usize;
    let total_methods = method_stats.len();
    while let Some(joined) = producers.join_next().await {
        if let Ok((name, failed)) = joined {
            if failed {
                failed_methods += 1;
                if let Some(stats) = method_stats.get_mut(&name) {
                    stats.failed = true;
                }
            }
        }
    }

    drop(result_tx);

    let found = shared.found.load(Ordering::Relaxed);
    if !canceled {
        let _ = shared.progress_tx.send(1.0);
    }

    if !canceled && failed_methods == total_methods && found == 0 {
        return Err(Error::Transient(format!(
            "all {total_methods} enumeration methods failed before any result"
        )));
    }

    // Attribute emitted results to each contributing method.
    {
        let counts = shared.result_counts.lock().expect("result counts poisoned");
        for (name, count) in counts.iter() {
            if let Some(stats) = method_stats.get_mut(name) {
                stats.results = *count;
            }
        }
    }

    let summary = EnumerationSummary {
        total_found: found,
        resolved_count: shared.resolved.load(Ordering::Relaxed),
        wildcard_count: shared.wildcards.load(Ordering::Relaxed),
        takeover_count: shared.takeovers.load(Ordering::Relaxed),
        method_stats,
        wildcard_detected,
        canceled,
    };

    Ok(summary)
}

/// Resolve one candidate and emit it if it is a unique, resolved,
/// non-wildcard name.
async fn process_candidate(
    shared: Arc<Shared>,
    root: String,
    fqdn: String,
    result_tx: mpsc::Sender<EnumeratedSubdomain>,
) {
    if shared.cancel.is_cancelled() {
        return;
    }

    let outcome = shared.resolver.resolve(&fqdn, DnsRecordType::A).await;
    shared.processed.fetch_add(1, Ordering::Relaxed);

    let records = match outcome {
        Ok(records) if !records.is_empty() => records,
        Ok(_) => {
            shared.publish_progress();
            return;
        }
        Err(DnsError::Nxdomain) => {
            // Definitive negative: nothing to emit.
            shared.publish_progress();
            return;
        }
        Err(e) => {
            tracing::debug!(fqdn = %fqdn, error = %e, "candidate resolution failed");
            shared.publish_progress();
            return;
        }
    };

    shared.resolved.fetch_add(1, Ordering::Relaxed);

    let (ip_set, cname) = wildcard::answer_shape(&records);
    let ips: Vec<String> = ip_set.into_iter().collect();

    let is_wildcard = {
        let fingerprint = shared.wildcard.read().expect("wildcard lock poisoned");
        fingerprint
            .as_ref()
            .is_some_and(|fp| wildcard::matches(fp, &ips, cname.as_deref()))
    };
    if is_wildcard {
        shared.wildcards.fetch_add(1, Ordering::Relaxed);
        if !shared.config.include_wildcards {
            shared.publish_progress();
            return;
        }
    }

    let mut is_takeover = false;
    let mut takeover_kind = None;
    if let Some(cname) = &cname {
        if let Some(matched) = shared.takeover.match_cname(cname) {
            let confirmed = if shared.config.verify_takeover_http && matched.has_body_check {
                shared
                    .takeover
                    .confirm_by_body(&shared.http, &fqdn, &matched.service)
                    .await
            } else {
                true
            };
            if confirmed {
                is_takeover = true;
                takeover_kind = Some(matched.service);
                shared.takeovers.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // Claim the source list; later duplicates of this name no longer merge.
    let sources = shared
        .pending_sources
        .lock()
        .expect("pending sources poisoned")
        .remove(&fqdn)
        .unwrap_or_default();

    let result = EnumeratedSubdomain {
        subdomain: fqdn,
        root_domain: root,
        ips,
        cname,
        record_type: "A".to_owned(),
        records,
        is_wildcard,
        is_resolved: true,
        is_takeover,
        takeover_kind,
        sources,
    };

    let sources_for_stats = result.sources.clone();
    if result_tx.send(result).await.is_ok() {
        shared.found.fetch_add(1, Ordering::Relaxed);
        let mut counts = shared.result_counts.lock().expect("result counts poisoned");
        for source in &sources_for_stats {
            *counts.entry(source.clone()).or_default() += 1;
        }
    }
    shared.publish_progress();
}
