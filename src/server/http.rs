//! Local HTTP proxy listener.
//!
//! CONNECT requests are tunneled through the upstream HTTP pool via the
//! dialer's CONNECT handshake. Plain requests are forwarded in absolute
//! form over a fresh connection to the selected upstream proxy, with
//! hop-by-hop headers stripped and `Connection: close` forced so the relay
//! terminates.

use std::sync::Arc;
use std::time::Duration;

use slog_scope::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::pool::dial::split_target;
use crate::pool::manager::{ProxyManager, FAILURE_EVICT_THRESHOLD};
use crate::pool::node::ProxyKind;

use super::dial_pool_upstream;

const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection:",
    "proxy-connection:",
    "keep-alive:",
    "proxy-authenticate:",
    "proxy-authorization:",
    "te:",
    "trailer:",
    "transfer-encoding:",
    "upgrade:",
];

pub struct HttpProxyServer {
    manager: Arc<ProxyManager>,
    dial_timeout: Duration,
}

impl HttpProxyServer {
    #[must_use]
    pub fn new(manager: Arc<ProxyManager>, dial_timeout: Duration) -> Self {
        Self {
            manager,
            dial_timeout,
        }
    }

    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(
            "http_proxy_listener_started";
            "listen_addr" => local_addr.to_string()
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(
                                "http_proxy_connection_accepted";
                                "peer_addr" => peer.to_string()
                            );
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle(stream).await {
                                    debug!(
                                        "http_proxy_connection_error";
                                        "error" => e.to_string()
                                    );
                                }
                            });
                        }
                        Err(e) => {
                            warn!("http_proxy_accept_error"; "error" => e.to_string());
                        }
                    }
                }
            }
        }
    }

    async fn handle(&self, client: TcpStream) -> anyhow::Result<()> {
        let mut buf_client = BufReader::new(client);

        let mut request_line = String::new();
        buf_client.read_line(&mut request_line).await?;
        let request_line = request_line.trim_end().to_string();
        if request_line.is_empty() {
            return Ok(());
        }

        let parts: Vec<&str> = request_line.split_whitespace().collect();
        if parts.len() < 3 {
            anyhow::bail!("malformed HTTP request line");
        }
        let method = parts[0];
        let target = parts[1];
        let version = parts[2];

        if method.eq_ignore_ascii_case("CONNECT") {
            self.handle_connect(buf_client, target).await
        } else {
            self.handle_forward(buf_client, method, target, version).await
        }
    }

    /// CONNECT tunneling (e.g. for HTTPS) through the upstream pool.
    async fn handle_connect(
        &self,
        mut buf_client: BufReader<TcpStream>,
        target: &str,
    ) -> anyhow::Result<()> {
        debug!("http_proxy_connect"; "target" => target);

        // Read and discard the remaining request headers.
        loop {
            let mut line = String::new();
            buf_client.read_line(&mut line).await?;
            if line.trim().is_empty() {
                break;
            }
        }

        if split_target(target).is_err() {
            respond(buf_client.get_mut(), "400 Bad Request").await?;
            anyhow::bail!("CONNECT target must be host:port");
        }

        match dial_pool_upstream(
            &self.manager,
            ProxyKind::Http,
            false,
            target,
            self.dial_timeout,
            false,
        )
        .await
        {
            Ok(mut remote) => {
                buf_client
                    .get_mut()
                    .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                    .await?;
                let mut client = buf_client.into_inner();
                if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut remote).await {
                    debug!("http_proxy_tunnel_closed"; "error" => e.to_string());
                }
            }
            Err(Error::EmptyPool) => {
                respond(buf_client.get_mut(), "503 Service Unavailable").await?;
            }
            Err(e) => {
                warn!(
                    "http_proxy_connect_failed";
                    "target" => target,
                    "error" => e.to_string()
                );
                respond(buf_client.get_mut(), "502 Bad Gateway").await?;
            }
        }

        Ok(())
    }

    /// Plain HTTP forwarding: send the request in absolute form over a
    /// fresh connection to the selected upstream proxy.
    async fn handle_forward(
        &self,
        mut buf_client: BufReader<TcpStream>,
        method: &str,
        target: &str,
        version: &str,
    ) -> anyhow::Result<()> {
        debug!("http_proxy_forward"; "method" => method, "target" => target);

        // Collect request headers, dropping hop-by-hop ones.
        let mut headers = Vec::new();
        let mut host_header = None;
        loop {
            let mut line = String::new();
            buf_client.read_line(&mut line).await?;
            if line.trim().is_empty() {
                break;
            }
            let lower = line.to_ascii_lowercase();
            if HOP_BY_HOP_HEADERS.iter().any(|h| lower.starts_with(h)) {
                continue;
            }
            if lower.starts_with("host:") {
                host_header = Some(line["host:".len()..].trim().to_string());
            }
            headers.push(line);
        }

        let absolute = match normalize_forward_target(target, host_header.as_deref()) {
            Ok(url) => url,
            Err(msg) => {
                respond(buf_client.get_mut(), "400 Bad Request").await?;
                anyhow::bail!("{msg}");
            }
        };

        let content_length: usize = headers
            .iter()
            .find(|h| h.to_ascii_lowercase().starts_with("content-length:"))
            .and_then(|h| h.split(':').nth(1))
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; content_length];
        if content_length > 0 {
            buf_client.read_exact(&mut body).await?;
        }

        // Attempt loop over the pool; the proxy connection itself is the
        // retryable part, the request is sent once.
        let mut dialed = None;
        for _ in 0..3 {
            let Some(node) = self.manager.current(ProxyKind::Http) else {
                respond(buf_client.get_mut(), "503 Service Unavailable").await?;
                return Ok(());
            };
            match timeout(self.dial_timeout, TcpStream::connect(node.addr())).await {
                Ok(Ok(remote)) => {
                    self.manager.report_success(&node);
                    dialed = Some((node, remote));
                    break;
                }
                _ => {
                    self.manager.report_failure(&node, FAILURE_EVICT_THRESHOLD);
                    let _ = self.manager.next(ProxyKind::Http);
                }
            }
        }
        let Some((node, mut remote)) = dialed else {
            respond(buf_client.get_mut(), "502 Bad Gateway").await?;
            return Ok(());
        };

        let mut out = format!("{method} {absolute} {version}\r\n");
        if host_header.is_none() {
            if let Some(host) = host_of_url(&absolute) {
                out.push_str(&format!("Host: {host}\r\n"));
            }
        }
        for header in &headers {
            out.push_str(header);
        }
        if node.has_credentials() {
            use base64::Engine as _;
            let creds = format!(
                "{}:{}",
                node.user.as_deref().unwrap_or(""),
                node.pass.as_deref().unwrap_or("")
            );
            out.push_str(&format!(
                "Proxy-Authorization: Basic {}\r\n",
                base64::engine::general_purpose::STANDARD.encode(creds)
            ));
        }
        // Force close so the upstream does not keep-alive the relay open.
        out.push_str("Connection: close\r\n\r\n");
        remote.write_all(out.as_bytes()).await?;
        if content_length > 0 {
            remote.write_all(&body).await?;
        }

        let mut client = buf_client.into_inner();
        let _ = tokio::io::copy_bidirectional(&mut client, &mut remote).await;
        Ok(())
    }
}

async fn respond(client: &mut TcpStream, status: &str) -> anyhow::Result<()> {
    client
        .write_all(format!("HTTP/1.1 {status}\r\n\r\n").as_bytes())
        .await?;
    Ok(())
}

/// Normalize the request target to an absolute http URL the upstream proxy
/// understands. Absolute-form passes through; origin-form is rebuilt from
/// the Host header; https absolute-form requires CONNECT.
fn normalize_forward_target(
    target: &str,
    host_header: Option<&str>,
) -> std::result::Result<String, String> {
    if target.starts_with("http://") {
        return Ok(target.to_string());
    }
    if target.starts_with("https://") {
        return Err("only http scheme supported (https requires CONNECT)".to_string());
    }
    if target.starts_with('/') {
        let host = host_header.ok_or_else(|| "missing Host header".to_string())?;
        if host.is_empty() {
            return Err("missing Host header".to_string());
        }
        return Ok(format!("http://{host}{target}"));
    }
    Err(format!("unsupported request target: {target}"))
}

fn host_of_url(url: &str) -> Option<&str> {
    let rest = url.strip_prefix("http://")?;
    Some(match rest.find('/') {
        Some(pos) => &rest[..pos],
        None => rest,
    })
}
