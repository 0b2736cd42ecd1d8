//! Local listeners: SOCKS5 and HTTP proxy front-ends plus the JSON control
//! API. These consume the pool core through the manager/dialer interfaces.

pub mod http;
pub mod socks5;
pub mod web;

use std::time::Duration;

use slog_scope::debug;
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::pool::dial;
use crate::pool::manager::{ProxyManager, FAILURE_EVICT_THRESHOLD};
use crate::pool::node::ProxyKind;

const DIAL_ATTEMPTS: usize = 3;

/// Dial `target` through the manager's current selection, retrying over the
/// pool on failure.
///
/// Every failed dial is reported (evicting the node after repeated
/// failures) and advances the cursor so the next attempt lands on a
/// different upstream. With `direct_fallback`, an empty pool degrades to a
/// direct dial instead of an error.
pub(crate) async fn dial_pool_upstream(
    manager: &ProxyManager,
    kind: ProxyKind,
    rotate_per_conn: bool,
    target: &str,
    dial_timeout: Duration,
    direct_fallback: bool,
) -> Result<TcpStream> {
    let mut last_err = None;
    for _ in 0..DIAL_ATTEMPTS {
        let node = if rotate_per_conn {
            manager.next(kind)
        } else {
            manager.current(kind)
        };
        let Some(node) = node else {
            if direct_fallback {
                return dial::dial_direct(target, dial_timeout).await;
            }
            return Err(last_err.unwrap_or(Error::EmptyPool));
        };
        match dial::dial_via_proxy(&node, target, dial_timeout).await {
            Ok(stream) => {
                manager.report_success(&node);
                return Ok(stream);
            }
            Err(err) => {
                debug!(
                    "upstream_dial_failed";
                    "proxy" => node.to_string(),
                    "target" => target,
                    "error" => err.to_string()
                );
                manager.report_failure(&node, FAILURE_EVICT_THRESHOLD);
                if !rotate_per_conn {
                    let _ = manager.next(kind);
                }
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or(Error::EmptyPool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::node::parse_proxy_line;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_empty_pool_direct_fallback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = stream.write_all(b"direct").await;
        });

        let manager = ProxyManager::new();
        let mut stream = dial_pool_upstream(
            &manager,
            ProxyKind::Socks5,
            false,
            &addr.to_string(),
            Duration::from_secs(2),
            true,
        )
        .await
        .unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"direct");
    }

    #[tokio::test]
    async fn test_empty_pool_without_fallback_errors() {
        let manager = ProxyManager::new();
        let err = dial_pool_upstream(
            &manager,
            ProxyKind::Http,
            false,
            "127.0.0.1:1",
            Duration::from_secs(1),
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::EmptyPool));
    }

    #[tokio::test]
    async fn test_failures_evict_and_advance() {
        // Two dead upstreams; every attempt fails, each node collects two
        // failures across the three attempts and the first is evicted.
        let manager = ProxyManager::new();
        manager.set_pool(vec![
            parse_proxy_line("socks5://127.0.0.1:1", "").unwrap(),
            parse_proxy_line("socks5://127.0.0.1:2", "").unwrap(),
        ]);
        let err = dial_pool_upstream(
            &manager,
            ProxyKind::Socks5,
            false,
            "9.9.9.9:80",
            Duration::from_millis(200),
            false,
        )
        .await
        .unwrap_err();
        assert!(!matches!(err, Error::EmptyPool));
        assert!(manager.pool_size() < 2, "repeated failures must evict");
    }
}
