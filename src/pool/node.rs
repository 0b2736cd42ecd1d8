//! Upstream proxy descriptors.
//!
//! A descriptor line is either `scheme://[user:pass@]host:port` or a bare
//! `[user:pass@]host:port`. Hosts must be literal IPs; feeds that hand out
//! DNS names are dropped at parse time.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks5,
    Http,
}

impl ProxyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Http => "http",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<ProxyKind> {
        match s {
            "socks5" => Some(ProxyKind::Socks5),
            "http" => Some(ProxyKind::Http),
            _ => None,
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upstream proxy. Identity is `(kind, ip, port)`; credentials, country
/// and latency are metadata and do not participate in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyNode {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    pub ip: IpAddr,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Last measured latency in milliseconds; -1 means never measured.
    #[serde(rename = "latency")]
    pub latency_ms: i64,
}

impl ProxyNode {
    #[must_use]
    pub fn new(kind: ProxyKind, ip: IpAddr, port: u16) -> Self {
        Self {
            id: SocketAddr::new(ip, port).to_string(),
            kind,
            ip,
            port,
            user: None,
            pass: None,
            country: None,
            latency_ms: -1,
        }
    }

    /// `ip:port` (IPv6 bracketed), the wire address of the upstream.
    #[must_use]
    pub fn addr(&self) -> String {
        SocketAddr::new(self.ip, self.port).to_string()
    }

    #[must_use]
    pub fn identity(&self) -> (ProxyKind, IpAddr, u16) {
        (self.kind, self.ip, self.port)
    }

    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.user.is_some() || self.pass.is_some()
    }
}

impl PartialEq for ProxyNode {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for ProxyNode {}

impl fmt::Display for ProxyNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.addr())
    }
}

/// Parse one descriptor line.
///
/// `default_kind` is applied to bare `host:port` lines when it is a
/// recognized transport (`socks5`/`http`); anything else (including `auto`)
/// falls back to a port heuristic. Unparseable lines yield `None` and are
/// silently dropped by callers.
pub fn parse_proxy_line(line: &str, default_kind: &str) -> Option<ProxyNode> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some((scheme, rest)) = line.split_once("://") {
        let kind = match scheme.to_ascii_lowercase().as_str() {
            "socks5" | "socks5h" => ProxyKind::Socks5,
            "http" | "https" => ProxyKind::Http,
            _ => return None,
        };
        let (userinfo, hostport) = split_userinfo(rest);
        let (ip, port) = split_host_port(hostport)?;
        let mut node = ProxyNode::new(kind, ip, port);
        if let Some(userinfo) = userinfo {
            let (user, pass) = match userinfo.split_once(':') {
                Some((u, p)) => (u, p),
                None => (userinfo, ""),
            };
            node.user = non_empty(user);
            node.pass = non_empty(pass);
        }
        return Some(node);
    }

    let default_kind = default_kind.trim().to_ascii_lowercase();
    let (userinfo, hostport) = split_userinfo(line);
    let (ip, port) = split_host_port(hostport)?;
    let kind = ProxyKind::parse(&default_kind).unwrap_or_else(|| guess_kind(port));

    let mut node = ProxyNode::new(kind, ip, port);
    if let Some(userinfo) = userinfo {
        // Bare form only carries credentials as user:pass; a lone token
        // before the @ is not enough to tell user from host typo.
        if let Some((user, pass)) = userinfo.split_once(':') {
            node.user = non_empty(user);
            node.pass = non_empty(pass);
        }
    }
    Some(node)
}

/// Parse a batch of descriptors, dropping the unparseable ones.
#[must_use]
pub fn parse_proxy_lines(lines: &[String], default_kind: &str) -> Vec<ProxyNode> {
    lines
        .iter()
        .filter_map(|l| parse_proxy_line(l, default_kind))
        .collect()
}

/// Ports conventionally used by SOCKS servers; everything else is assumed
/// to be an HTTP proxy. Feeds that carry a scheme or a source-level type
/// override this guess.
fn guess_kind(port: u16) -> ProxyKind {
    match port {
        1080 | 1081 | 1085 | 4145 | 9050 | 9150 => ProxyKind::Socks5,
        _ => ProxyKind::Http,
    }
}

/// Split at the LAST `@` so passwords containing `@` survive.
fn split_userinfo(s: &str) -> (Option<&str>, &str) {
    match s.rfind('@') {
        Some(idx) if idx > 0 => (Some(&s[..idx]), &s[idx + 1..]),
        _ => (None, s),
    }
}

/// Split `host:port`, accepting `[v6]:port`. Unbracketed IPv6 with a port is
/// ambiguous and rejected, as are DNS names and out-of-range ports.
fn split_host_port(s: &str) -> Option<(IpAddr, u16)> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        rest.split_once("]:")?
    } else {
        let (host, port) = s.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        (host, port)
    };
    let ip: IpAddr = host.trim().parse().ok()?;
    let port: u16 = port.trim().parse().ok()?;
    if port == 0 {
        return None;
    }
    Some((ip, port))
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
