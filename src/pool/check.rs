//! HTTP-level reachability probe through a candidate upstream.
//!
//! Unlike the raw dialer this exercises the node the way an HTTP client
//! would use it: plain-HTTP targets go through absolute-form forwarding on
//! HTTP upstreams and CONNECT/SOCKS tunneling otherwise, all handled by the
//! reqwest proxy support.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};

use super::dial::USER_AGENT;
use super::node::ProxyNode;

/// GET `target_url` through `node`. Any non-5xx status counts as reachable;
/// public proxies routinely answer 3xx/4xx depending on the target. Returns
/// the wall-clock latency in milliseconds.
pub async fn check_http_via_proxy(
    node: &ProxyNode,
    target_url: &str,
    check_timeout: Duration,
) -> Result<i64> {
    let url: reqwest::Url = target_url
        .parse()
        .map_err(|_| Error::Config(format!("invalid check url: {target_url}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(Error::Config(format!("unsupported url scheme: {other}")));
        }
    }

    let start = Instant::now();
    let mut proxy = reqwest::Proxy::all(proxy_url(node))?;
    if node.has_credentials() {
        proxy = proxy.basic_auth(
            node.user.as_deref().unwrap_or(""),
            node.pass.as_deref().unwrap_or(""),
        );
    }
    let client = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(check_timeout)
        .user_agent(USER_AGENT)
        .build()?;

    let resp = client.get(url).send().await?;
    let status = resp.status();
    drop(resp);
    let latency = start.elapsed().as_millis() as i64;
    if status.as_u16() >= 500 {
        return Err(Error::CheckStatus(status.as_u16()));
    }
    Ok(latency.max(1))
}

fn proxy_url(node: &ProxyNode) -> String {
    format!("{}://{}", node.kind, node.addr())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::node::parse_proxy_line;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Fake HTTP upstream proxy: answers any absolute-form request with the
    /// given status line.
    async fn mock_http_upstream(status_line: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut head = Vec::new();
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        head.extend_from_slice(&buf[..n]);
                        if head.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let resp = format!(
                        "{status_line}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_check_reachable() {
        let upstream = mock_http_upstream("HTTP/1.1 200 OK").await;
        let node = parse_proxy_line(&format!("http://{upstream}"), "").unwrap();
        let latency =
            check_http_via_proxy(&node, "http://example.invalid/", Duration::from_secs(5))
                .await
                .unwrap();
        assert!(latency >= 1);
    }

    #[tokio::test]
    async fn test_check_counts_4xx_as_reachable() {
        let upstream = mock_http_upstream("HTTP/1.1 404 Not Found").await;
        let node = parse_proxy_line(&format!("http://{upstream}"), "").unwrap();
        assert!(check_http_via_proxy(
            &node,
            "http://example.invalid/",
            Duration::from_secs(5)
        )
        .await
        .is_ok());
    }

    #[tokio::test]
    async fn test_check_rejects_5xx() {
        let upstream = mock_http_upstream("HTTP/1.1 502 Bad Gateway").await;
        let node = parse_proxy_line(&format!("http://{upstream}"), "").unwrap();
        let err = check_http_via_proxy(
            &node,
            "http://example.invalid/",
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::CheckStatus(502)), "got: {err}");
    }

    #[tokio::test]
    async fn test_check_rejects_bad_scheme() {
        let node = parse_proxy_line("http://1.2.3.4:8080", "").unwrap();
        let err = check_http_via_proxy(&node, "ftp://example.com/", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
