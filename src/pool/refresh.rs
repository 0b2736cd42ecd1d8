//! Refresh orchestration: fetch, validate, swap.
//!
//! One refresher instance executes at most one cycle at a time; re-entrant
//! callers block on the internal mutex. The refresher is the only writer of
//! `set_pool`, and a failed cycle never replaces a working pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use slog_scope::{info, warn};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

use super::dial::USER_AGENT;
use super::fetch::{fetch_from_sources, merge_dedup, FetchOutcome, ProxySource, FETCH_TIMEOUT};
use super::manager::ProxyManager;
use super::node::parse_proxy_lines;
use super::validate::{validate_and_filter, ValidationConfig, ValidationOutcome};

/// What one refresh cycle produced. `count == 0` with an error is a failed
/// cycle; a non-zero count with an error is a partial success and the error
/// is a warning.
#[derive(Debug)]
pub struct RefreshReport {
    pub count: usize,
    pub error: Option<Error>,
}

impl RefreshReport {
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.count == 0 && self.error.is_some()
    }
}

pub struct Refresher {
    managers: Vec<Arc<ProxyManager>>,
    sources: Vec<ProxySource>,
    static_proxies: Vec<String>,
    validation: ValidationConfig,
    dial_timeout: Duration,
    client: reqwest::Client,
    gate: Mutex<()>,
}

impl Refresher {
    pub fn new(
        managers: Vec<Arc<ProxyManager>>,
        sources: Vec<ProxySource>,
        static_proxies: Vec<String>,
        validation: ValidationConfig,
        dial_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            managers,
            sources,
            static_proxies,
            validation,
            dial_timeout,
            client,
            gate: Mutex::new(()),
        })
    }

    /// Run one refresh cycle. Serialized against concurrent callers.
    pub async fn refresh(&self) -> RefreshReport {
        let _flight = self.gate.lock().await;

        let static_nodes = parse_proxy_lines(&self.static_proxies, "auto");
        let (fetched, fetch_warning) =
            match fetch_from_sources(&self.client, &self.sources).await {
                Ok(FetchOutcome { nodes, warning }) => (nodes, warning),
                Err(err) => {
                    if static_nodes.is_empty() {
                        return self.fail(err);
                    }
                    // Statics keep the cycle alive; the fetch error is
                    // downgraded to a warning.
                    (Vec::new(), Some(err))
                }
            };

        let merged = merge_dedup([static_nodes, fetched]);
        if merged.is_empty() {
            return self.fail(fetch_warning.unwrap_or(Error::EmptyPool));
        }

        let (nodes, error) =
            match validate_and_filter(merged, &self.validation, self.dial_timeout).await {
                ValidationOutcome::Skipped(nodes) => (nodes, fetch_warning),
                ValidationOutcome::Validated(report) => {
                    if report.nodes.is_empty() {
                        // Keep the existing pool untouched when the new one
                        // is unusable.
                        return self.fail(report.error.unwrap_or(Error::NoValidProxies));
                    }
                    info!(
                        "validation_pass_finished";
                        "kept" => report.nodes.len(),
                        "tested_socks5" => report.tested_socks5,
                        "tested_http" => report.tested_http
                    );
                    // A fetch warning still surfaces when validation itself
                    // was clean.
                    let error = report.error.or(fetch_warning);
                    (report.nodes, error)
                }
            };

        let count = nodes.len();
        let now = Utc::now();
        for manager in &self.managers {
            manager.set_pool(nodes.clone());
            manager.set_refresh_result(now, error.as_ref());
        }
        match &error {
            Some(err) => warn!(
                "refresh_finished_with_warning";
                "pool_size" => count,
                "warning" => err.to_string()
            ),
            None => info!("refresh_finished"; "pool_size" => count),
        }
        RefreshReport { count, error }
    }

    fn fail(&self, err: Error) -> RefreshReport {
        let now = Utc::now();
        for manager in &self.managers {
            manager.set_refresh_result(now, Some(&err));
        }
        warn!("refresh_failed"; "error" => err.to_string());
        RefreshReport {
            count: 0,
            error: Some(err),
        }
    }
}
