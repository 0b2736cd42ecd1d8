//! Remote feed retrieval and cross-feed merging.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

use super::node::{parse_proxy_line, ProxyNode};

pub const DEFAULT_SOCKS5_SOURCE: &str =
    "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/socks5.txt";

/// Client-level deadline for a single feed GET.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// A feed descriptor. `kind` is the default transport assigned to lines in
/// that feed that carry no scheme: `socks5`, `http`, `auto` or empty.
#[derive(Debug, Clone, Serialize)]
pub struct ProxySource {
    pub url: String,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

impl ProxySource {
    pub fn validate(&self) -> Result<()> {
        match self.kind.trim().to_ascii_lowercase().as_str() {
            "" | "auto" | "socks5" | "http" => Ok(()),
            other => Err(Error::Config(format!("unsupported source type: {other:?}"))),
        }
    }
}

// Config accepts both a plain URL string and a {url, type} object.
impl<'de> Deserialize<'de> for ProxySource {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Url(String),
            Full {
                url: String,
                #[serde(rename = "type", default)]
                kind: String,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Url(url) => ProxySource {
                url: url.trim().to_string(),
                kind: String::new(),
            },
            Repr::Full { url, kind } => ProxySource {
                url: url.trim().to_string(),
                kind,
            },
        })
    }
}

#[must_use]
pub fn default_sources() -> Vec<ProxySource> {
    vec![ProxySource {
        url: DEFAULT_SOCKS5_SOURCE.to_string(),
        kind: "socks5".to_string(),
    }]
}

/// Result of a fetch pass: merged nodes plus the joined per-source errors
/// when some sources failed but others produced candidates.
#[derive(Debug)]
pub struct FetchOutcome {
    pub nodes: Vec<ProxyNode>,
    pub warning: Option<Error>,
}

/// Fetch every source in order and merge the results.
///
/// Partial success returns the surviving nodes plus a joined warning. All
/// sources failing returns the joined error; all sources succeeding with an
/// empty merge returns `Error::EmptyPool`.
pub async fn fetch_from_sources(
    client: &reqwest::Client,
    sources: &[ProxySource],
) -> Result<FetchOutcome> {
    if sources.is_empty() {
        return Err(Error::Fetch("no sources".to_string()));
    }

    let mut lists = Vec::with_capacity(sources.len());
    let mut errors = Vec::new();
    let mut any_ok = false;
    for source in sources {
        match fetch_from_url(client, &source.url, &source.kind).await {
            Ok(nodes) => {
                any_ok = true;
                lists.push(nodes);
            }
            Err(err) => errors.push(format!("{}: {}", source.url, err)),
        }
    }

    let nodes = merge_dedup(lists);
    if nodes.is_empty() {
        if any_ok {
            return Err(Error::EmptyPool);
        }
        return Err(Error::Fetch(errors.join("; ")));
    }

    let warning = if errors.is_empty() {
        None
    } else {
        Some(Error::Fetch(errors.join("; ")))
    };
    Ok(FetchOutcome { nodes, warning })
}

/// Fetch one feed and parse it line by line, deduplicating within the feed.
pub async fn fetch_from_url(
    client: &reqwest::Client,
    url: &str,
    default_kind: &str,
) -> Result<Vec<ProxyNode>> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(Error::Fetch(format!("fetch {url}: http {}", status.as_u16())));
    }
    let body = resp.text().await?;

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for line in body.lines() {
        let Some(node) = parse_proxy_line(line, default_kind) else {
            continue;
        };
        if seen.insert(node.identity()) {
            out.push(node);
        }
    }
    Ok(out)
}

/// Concatenate node lists preserving first-seen order, dropping duplicate
/// `(kind, ip, port)` identities, re-deriving ids and normalizing a zero
/// latency back to the -1 sentinel. Idempotent.
#[must_use]
pub fn merge_dedup<I>(lists: I) -> Vec<ProxyNode>
where
    I: IntoIterator<Item = Vec<ProxyNode>>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for list in lists {
        for mut node in list {
            if !seen.insert(node.identity()) {
                continue;
            }
            node.id = node.addr();
            if node.latency_ms == 0 {
                node.latency_ms = -1;
            }
            out.push(node);
        }
    }
    out
}
