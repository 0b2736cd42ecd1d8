//! Bounded-concurrency candidate validation with early stop.
//!
//! Workers drain a shared candidate list, probing each entry once under a
//! per-probe timeout. The collector cancels a shared token as soon as the
//! keep target is reached; in-flight probes abort and queued candidates are
//! never pulled. Probe failures are swallowed into `ok=false` and never
//! surfaced individually.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

use super::check::check_http_via_proxy;
use super::dial::dial_via_proxy;
use super::fetch::merge_dedup;
use super::node::{ProxyKind, ProxyNode};

/// Hard deadline for a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(20);

const DEFAULT_CONCURRENCY: usize = 64;
const MAX_CONCURRENCY: usize = 256;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub http_test_url: String,
    pub socks5_test_addr: String,
    /// Keep target per kind. 0 means "use the default cap"; negative
    /// removes the keep target (no early stop), though probing is still
    /// bounded by the 2000-candidate budget.
    pub max_http: i64,
    pub max_socks5: i64,
    pub concurrency: usize,
}

impl ValidationConfig {
    pub fn apply_defaults(&mut self) {
        if self.http_test_url.is_empty() {
            self.http_test_url = "http://example.com/".to_string();
        }
        if self.socks5_test_addr.is_empty() {
            self.socks5_test_addr = "example.com:443".to_string();
        }
        if self.max_http == 0 {
            self.max_http = 500;
        }
        if self.max_socks5 == 0 {
            self.max_socks5 = 200;
        }
        if self.concurrency == 0 {
            self.concurrency = DEFAULT_CONCURRENCY;
        }
        if self.concurrency > MAX_CONCURRENCY {
            self.concurrency = MAX_CONCURRENCY;
        }
    }
}

/// What a validation pass produced. `Skipped` means validation is disabled
/// and the caller should treat the input as already valid.
#[derive(Debug)]
pub enum ValidationOutcome {
    Skipped(Vec<ProxyNode>),
    Validated(ValidationReport),
}

#[derive(Debug)]
pub struct ValidationReport {
    /// Survivors in the order their successes were observed, deduplicated
    /// across kinds.
    pub nodes: Vec<ProxyNode>,
    pub tested_socks5: usize,
    pub tested_http: usize,
    pub error: Option<Error>,
}

/// Cap on how many candidates are actually probed.
///
/// With no keep target the pass is bounded at 2000; otherwise ten times the
/// keep target, clamped to [200, 5000], keeps enough headroom to reach the
/// target under pathological feeds without probing the whole list.
#[must_use]
pub fn candidate_limit(total: usize, keep: usize) -> usize {
    if total == 0 {
        return 0;
    }
    if keep == 0 {
        return total.min(2000);
    }
    (keep * 10).clamp(200, 5000).min(total)
}

/// Partition the input by kind, validate each partition, merge survivors.
pub async fn validate_and_filter(
    nodes: Vec<ProxyNode>,
    cfg: &ValidationConfig,
    dial_timeout: Duration,
) -> ValidationOutcome {
    if !cfg.enabled {
        return ValidationOutcome::Skipped(nodes);
    }
    let mut cfg = cfg.clone();
    cfg.apply_defaults();

    let mut socks_candidates = Vec::new();
    let mut http_candidates = Vec::new();
    for node in nodes {
        match node.kind {
            ProxyKind::Socks5 => socks_candidates.push(node),
            ProxyKind::Http => http_candidates.push(node),
        }
    }

    let socks_keep = cfg.max_socks5.max(0) as usize;
    socks_candidates.truncate(candidate_limit(socks_candidates.len(), socks_keep));
    let test_addr = cfg.socks5_test_addr.clone();
    let (valid_socks5, tested_socks5) = run_validation(
        socks_candidates,
        cfg.concurrency,
        socks_keep,
        move |node| {
            let test_addr = test_addr.clone();
            async move {
                let start = Instant::now();
                match dial_via_proxy(&node, &test_addr, dial_timeout).await {
                    Ok(stream) => {
                        drop(stream);
                        let mut node = node;
                        node.latency_ms = (start.elapsed().as_millis() as i64).max(1);
                        Some(node)
                    }
                    Err(_) => None,
                }
            }
        },
    )
    .await;

    let http_keep = cfg.max_http.max(0) as usize;
    http_candidates.truncate(candidate_limit(http_candidates.len(), http_keep));
    let test_url = cfg.http_test_url.clone();
    let (valid_http, tested_http) = run_validation(
        http_candidates,
        cfg.concurrency,
        http_keep,
        move |node| {
            let test_url = test_url.clone();
            async move {
                match check_http_via_proxy(&node, &test_url, dial_timeout).await {
                    Ok(latency) => {
                        let mut node = node;
                        node.latency_ms = latency;
                        Some(node)
                    }
                    Err(_) => None,
                }
            }
        },
    )
    .await;

    let merged = merge_dedup([valid_socks5, valid_http]);
    let error = if merged.is_empty() {
        Some(Error::NoValidProxies)
    } else {
        None
    };
    ValidationOutcome::Validated(ValidationReport {
        nodes: merged,
        tested_socks5,
        tested_http,
        error,
    })
}

/// Probe `candidates` with at most `concurrency` workers, keeping the first
/// `keep` successes (`keep == 0` keeps everything that passes). Returns the
/// survivors in success order and the number of probes actually executed.
pub async fn run_validation<F, Fut>(
    candidates: Vec<ProxyNode>,
    concurrency: usize,
    keep: usize,
    probe: F,
) -> (Vec<ProxyNode>, usize)
where
    F: Fn(ProxyNode) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<ProxyNode>> + Send + 'static,
{
    if candidates.is_empty() {
        return (Vec::new(), 0);
    }
    let concurrency = if concurrency == 0 { 32 } else { concurrency };
    let concurrency = concurrency.min(candidates.len());

    let cancel = CancellationToken::new();
    // Buffered so a worker publishing after cancel never blocks the drain.
    let (result_tx, mut result_rx) = mpsc::channel::<Option<ProxyNode>>(concurrency);
    let candidates = Arc::new(candidates);
    let next = Arc::new(AtomicUsize::new(0));
    let probe = Arc::new(probe);

    let mut workers = JoinSet::new();
    for _ in 0..concurrency {
        let candidates = Arc::clone(&candidates);
        let next = Arc::clone(&next);
        let cancel = cancel.clone();
        let result_tx = result_tx.clone();
        let probe = Arc::clone(&probe);
        workers.spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let idx = next.fetch_add(1, Ordering::Relaxed);
                let Some(node) = candidates.get(idx) else {
                    break;
                };
                let fut = (probe.as_ref())(node.clone());
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = tokio::time::timeout(PROBE_TIMEOUT, fut) => res.ok().flatten(),
                };
                if result_tx.send(outcome).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let mut survivors = Vec::new();
    let mut tested = 0usize;
    while let Some(result) = result_rx.recv().await {
        tested += 1;
        if let Some(node) = result {
            survivors.push(node);
            if keep > 0 && survivors.len() >= keep {
                cancel.cancel();
            }
        }
    }
    while workers.join_next().await.is_some() {}

    (survivors, tested)
}
