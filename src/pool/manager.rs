//! Pool state: active upstreams, rotation cursors, failure accounting.
//!
//! The pool is replaced wholesale on refresh (copy-on-replace) and never
//! mutated in place, so snapshots are shallow copies under the read lock.
//! Several independent managers can coexist in one process; the refresher
//! broadcasts the same pool to each of them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Error;

use super::node::{ProxyKind, ProxyNode};

/// Consecutive dial failures after which a node is evicted from the pool.
pub const FAILURE_EVICT_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Status {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_socks5: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_http: String,
    pub current_socks5_index: usize,
    pub current_http_index: usize,

    pub socks5_pool_size: usize,
    pub http_pool_size: usize,
    pub pool_size: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refresh_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_refresh_err: String,
}

#[derive(Default)]
struct ManagerState {
    pool_all: Vec<ProxyNode>,
    pool_http: Vec<ProxyNode>,
    pool_socks5: Vec<ProxyNode>,

    cursor_http: usize,
    cursor_socks5: usize,

    // Keyed by ip:port; cleared wholesale on every pool swap.
    failures: HashMap<String, u32>,

    last_refresh_at: Option<DateTime<Utc>>,
    last_refresh_err: String,
}

impl ManagerState {
    fn pool(&self, kind: ProxyKind) -> &Vec<ProxyNode> {
        match kind {
            ProxyKind::Http => &self.pool_http,
            ProxyKind::Socks5 => &self.pool_socks5,
        }
    }

    fn cursor(&self, kind: ProxyKind) -> usize {
        match kind {
            ProxyKind::Http => self.cursor_http,
            ProxyKind::Socks5 => self.cursor_socks5,
        }
    }

    fn pool_and_cursor_mut(&mut self, kind: ProxyKind) -> (&mut Vec<ProxyNode>, &mut usize) {
        match kind {
            ProxyKind::Http => (&mut self.pool_http, &mut self.cursor_http),
            ProxyKind::Socks5 => (&mut self.pool_socks5, &mut self.cursor_socks5),
        }
    }

    fn remove_node(&mut self, node: &ProxyNode) {
        self.pool_all.retain(|n| n.identity() != node.identity());
        let (pool, cursor) = self.pool_and_cursor_mut(node.kind);
        let Some(idx) = pool.iter().position(|n| n.identity() == node.identity()) else {
            return;
        };
        pool.remove(idx);
        // Removal must not flip the apparent current selection: an entry
        // removed before the cursor shifts everything left by one.
        if pool.is_empty() {
            *cursor = 0;
        } else if idx < *cursor {
            *cursor -= 1;
        } else if *cursor >= pool.len() {
            *cursor = 0;
        }
    }
}

#[derive(Default)]
pub struct ProxyManager {
    state: RwLock<ManagerState>,
}

impl ProxyManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the pool atomically. Clears the failure counter and clamps
    /// both cursors into the new ranges.
    pub fn set_pool(&self, nodes: Vec<ProxyNode>) {
        let mut s = self.state.write();
        s.pool_http = nodes
            .iter()
            .filter(|n| n.kind == ProxyKind::Http)
            .cloned()
            .collect();
        s.pool_socks5 = nodes
            .iter()
            .filter(|n| n.kind == ProxyKind::Socks5)
            .cloned()
            .collect();
        s.pool_all = nodes;
        s.failures.clear();
        if s.cursor_http >= s.pool_http.len() {
            s.cursor_http = 0;
        }
        if s.cursor_socks5 >= s.pool_socks5.len() {
            s.cursor_socks5 = 0;
        }
    }

    #[must_use]
    pub fn current(&self, kind: ProxyKind) -> Option<ProxyNode> {
        let s = self.state.read();
        s.pool(kind).get(s.cursor(kind)).cloned()
    }

    /// Advance the cursor modulo pool size and return the new selection.
    #[must_use]
    pub fn next(&self, kind: ProxyKind) -> Option<ProxyNode> {
        let mut s = self.state.write();
        let (pool, cursor) = s.pool_and_cursor_mut(kind);
        if pool.is_empty() {
            return None;
        }
        *cursor = (*cursor + 1) % pool.len();
        Some(pool[*cursor].clone())
    }

    pub fn report_success(&self, node: &ProxyNode) {
        self.state.write().failures.remove(&node.addr());
    }

    /// Record a failure. Once `remove_after` consecutive failures accumulate
    /// (with no intervening success or pool swap) the node is evicted.
    pub fn report_failure(&self, node: &ProxyNode, remove_after: u32) {
        let mut s = self.state.write();
        // Counter keys stay a subset of pool identities; a report for a
        // node that was already evicted or swapped out is a no-op.
        if !s
            .pool(node.kind)
            .iter()
            .any(|n| n.identity() == node.identity())
        {
            return;
        }
        let key = node.addr();
        let count = {
            let entry = s.failures.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if remove_after > 0 && count >= remove_after {
            s.failures.remove(&key);
            s.remove_node(node);
        }
    }

    /// Unconditional removal with the same cursor-preservation rules as
    /// failure-driven eviction.
    pub fn remove(&self, node: &ProxyNode) {
        let mut s = self.state.write();
        s.failures.remove(&node.addr());
        s.remove_node(node);
    }

    pub fn set_refresh_result(&self, at: DateTime<Utc>, err: Option<&Error>) {
        let mut s = self.state.write();
        s.last_refresh_at = Some(at);
        s.last_refresh_err = err.map(ToString::to_string).unwrap_or_default();
    }

    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.state.read().pool_all.len()
    }

    #[must_use]
    pub fn pool_size_by_kind(&self, kind: ProxyKind) -> usize {
        self.state.read().pool(kind).len()
    }

    /// First `limit` pool entries in refresh order; `limit == 0` means all.
    #[must_use]
    pub fn pool_snapshot(&self, limit: usize) -> Vec<ProxyNode> {
        let s = self.state.read();
        let n = if limit == 0 || limit > s.pool_all.len() {
            s.pool_all.len()
        } else {
            limit
        };
        s.pool_all[..n].to_vec()
    }

    #[must_use]
    pub fn pool_snapshot_by_kind(&self, kind: ProxyKind, limit: usize) -> Vec<ProxyNode> {
        let s = self.state.read();
        let pool = s.pool(kind);
        let n = if limit == 0 || limit > pool.len() {
            pool.len()
        } else {
            limit
        };
        pool[..n].to_vec()
    }

    #[must_use]
    pub fn failure_count(&self, node: &ProxyNode) -> u32 {
        self.state
            .read()
            .failures
            .get(&node.addr())
            .copied()
            .unwrap_or(0)
    }

    /// Internally consistent snapshot of the whole manager.
    #[must_use]
    pub fn status(&self) -> Status {
        let s = self.state.read();
        let current_socks5 = s
            .pool_socks5
            .get(s.cursor_socks5)
            .map(ProxyNode::addr)
            .unwrap_or_default();
        let current_http = s
            .pool_http
            .get(s.cursor_http)
            .map(ProxyNode::addr)
            .unwrap_or_default();
        Status {
            current_socks5,
            current_http,
            current_socks5_index: s.cursor_socks5,
            current_http_index: s.cursor_http,
            socks5_pool_size: s.pool_socks5.len(),
            http_pool_size: s.pool_http.len(),
            pool_size: s.pool_all.len(),
            last_refresh_at: s.last_refresh_at,
            last_refresh_err: s.last_refresh_err.clone(),
        }
    }
}
