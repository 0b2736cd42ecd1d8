//! Upstream dialing: open a TCP stream to a target through a proxy node.
//!
//! SOCKS5 uses a hand-rolled RFC 1928 client handshake with RFC 1929
//! username/password sub-negotiation when the node carries credentials.
//! HTTP upstreams use a CONNECT handshake with a compatibility fallback:
//! some deployed intermediaries reject HTTP/1.1 CONNECT requests outright,
//! so a minimal HTTP/1.0 variant is retried on specific status codes.

use std::net::IpAddr;
use std::time::Duration;

use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};

use super::node::{ProxyKind, ProxyNode};

pub const USER_AGENT: &str = concat!("poolmux/", env!("CARGO_PKG_VERSION"));

// SOCKS5 protocol constants
const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Dial the target directly, without any upstream. Fallback path for an
/// empty pool, never the default.
pub async fn dial_direct(target: &str, dial_timeout: Duration) -> Result<TcpStream> {
    match timeout(dial_timeout, TcpStream::connect(target)).await {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(Error::Timeout),
    }
}

/// Dial `target` (host:port; the host may be a DNS name) through `node`.
pub async fn dial_via_proxy(
    node: &ProxyNode,
    target: &str,
    dial_timeout: Duration,
) -> Result<TcpStream> {
    match node.kind {
        ProxyKind::Socks5 => dial_via_socks5(node, target, dial_timeout).await,
        ProxyKind::Http => dial_via_http_connect(node, target, dial_timeout).await,
    }
}

async fn dial_via_socks5(
    node: &ProxyNode,
    target: &str,
    dial_timeout: Duration,
) -> Result<TcpStream> {
    let (host, port) = split_target(target)?;
    match timeout(dial_timeout, socks5_handshake(node, &host, port)).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout),
    }
}

async fn socks5_handshake(node: &ProxyNode, host: &str, port: u16) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(node.addr()).await?;

    // 1. Greeting: offer no-auth, plus user/pass when we have credentials.
    if node.has_credentials() {
        stream
            .write_all(&[SOCKS_VERSION, 2, AUTH_NONE, AUTH_USERPASS])
            .await?;
    } else {
        stream.write_all(&[SOCKS_VERSION, 1, AUTH_NONE]).await?;
    }
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(Error::Socks(format!("unexpected version {}", choice[0])));
    }
    match choice[1] {
        AUTH_NONE => {}
        AUTH_USERPASS => {
            let user = node.user.as_deref().unwrap_or("");
            let pass = node.pass.as_deref().unwrap_or("");
            if user.len() > 255 || pass.len() > 255 {
                return Err(Error::Socks("credentials too long".to_string()));
            }
            let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
            msg.push(0x01); // sub-negotiation version
            msg.push(user.len() as u8);
            msg.extend_from_slice(user.as_bytes());
            msg.push(pass.len() as u8);
            msg.extend_from_slice(pass.as_bytes());
            stream.write_all(&msg).await?;
            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(Error::Socks("authentication rejected".to_string()));
            }
        }
        AUTH_NO_ACCEPTABLE => {
            return Err(Error::Socks("no acceptable auth method".to_string()));
        }
        other => {
            return Err(Error::Socks(format!("unexpected auth method {other}")));
        }
    }

    // 2. CONNECT request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut req = Vec::with_capacity(7 + host.len());
    req.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00]);
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            req.push(ATYP_IPV4);
            req.extend_from_slice(&v4.octets());
        }
        Ok(IpAddr::V6(v6)) => {
            req.push(ATYP_IPV6);
            req.extend_from_slice(&v6.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(Error::Socks("target hostname too long".to_string()));
            }
            req.push(ATYP_DOMAIN);
            req.push(host.len() as u8);
            req.extend_from_slice(host.as_bytes());
        }
    }
    req.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&req).await?;

    // 3. Reply: VER REP RSV ATYP BND.ADDR BND.PORT
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != 0x00 {
        return Err(Error::Socks(format!("connect rejected: reply {}", head[1])));
    }
    let bound_len = match head[3] {
        ATYP_IPV4 => 4usize,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => stream.read_u8().await? as usize,
        other => {
            return Err(Error::Socks(format!("unexpected address type {other}")));
        }
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}

struct ConnectOptions {
    http_version: &'static str,
    host_header: String,
    proxy_connection: bool,
    user_agent: &'static str,
}

async fn dial_via_http_connect(
    node: &ProxyNode,
    target: &str,
    dial_timeout: Duration,
) -> Result<TcpStream> {
    // CONNECT requires host:port; default to 443 when the port is missing.
    let target = ensure_port(target, 443);

    // Variant 1: HTTP/1.1 + common headers.
    let first = http_connect_handshake(
        node,
        &target,
        dial_timeout,
        ConnectOptions {
            http_version: "HTTP/1.1",
            host_header: target.clone(),
            proxy_connection: true,
            user_agent: USER_AGENT,
        },
    )
    .await;

    match first {
        Ok(stream) => Ok(stream),
        // Variant 2 only on codes that signal the request form itself was
        // refused; retrying a network-level failure against the same proxy
        // is wasted work.
        Err(Error::HttpConnect { code, .. }) if matches!(code, 400 | 405 | 501) => {
            let (host_only, _) = split_target(&target)?;
            http_connect_handshake(
                node,
                &target,
                dial_timeout,
                ConnectOptions {
                    http_version: "HTTP/1.0",
                    host_header: host_only,
                    proxy_connection: false,
                    user_agent: "",
                },
            )
            .await
        }
        Err(err) => Err(err),
    }
}

async fn http_connect_handshake(
    node: &ProxyNode,
    target: &str,
    dial_timeout: Duration,
    opt: ConnectOptions,
) -> Result<TcpStream> {
    let node = node.clone();
    let target = target.to_string();
    let handshake = async move {
        let mut stream = TcpStream::connect(node.addr()).await?;

        let mut req = format!("CONNECT {} {}\r\n", target, opt.http_version);
        if !opt.host_header.is_empty() {
            req.push_str(&format!("Host: {}\r\n", opt.host_header));
        }
        if opt.proxy_connection {
            req.push_str("Proxy-Connection: Keep-Alive\r\n");
        }
        if !opt.user_agent.is_empty() {
            req.push_str(&format!("User-Agent: {}\r\n", opt.user_agent));
        }
        if node.has_credentials() {
            let user = node.user.as_deref().unwrap_or("");
            let pass = node.pass.as_deref().unwrap_or("");
            req.push_str(&format!(
                "Proxy-Authorization: Basic {}\r\n",
                basic_auth(user, pass)
            ));
        }
        req.push_str("\r\n");
        stream.write_all(req.as_bytes()).await?;

        let head = read_response_head(&mut stream).await?;
        let text = String::from_utf8_lossy(&head);
        let status_line = text.lines().next().unwrap_or("").trim_end().to_string();
        match parse_status_code(&status_line) {
            Some(200) => Ok(stream),
            Some(code) => Err(Error::HttpConnect {
                proxy: node.addr(),
                target: target.clone(),
                code,
                status_line,
            }),
            None => Err(Error::HttpConnect {
                proxy: node.addr(),
                target: target.clone(),
                code: 0,
                status_line,
            }),
        }
    };
    match timeout(dial_timeout, handshake).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout),
    }
}

/// Read the response head up to the blank line. Reads are unbuffered so no
/// tunnel bytes are consumed past the header terminator.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    const MAX_HEAD: usize = 16 * 1024;
    let mut head = Vec::with_capacity(256);
    loop {
        let byte = match stream.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "proxy closed connection during handshake",
                ));
            }
            Err(e) => return Err(e),
        };
        head.push(byte);
        if head.ends_with(b"\r\n\r\n") || head.ends_with(b"\n\n") {
            return Ok(head);
        }
        if head.len() > MAX_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized proxy response header",
            ));
        }
    }
}

fn parse_status_code(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    let _proto = parts.next()?;
    parts.next()?.parse().ok()
}

fn basic_auth(user: &str, pass: &str) -> String {
    base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
}

/// Split `host:port` where host may be a DNS name, an IPv4 literal, or a
/// bracketed IPv6 literal. Brackets are stripped from the returned host.
pub(crate) fn split_target(target: &str) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        rest.split_once("]:")
            .ok_or_else(|| Error::InvalidTarget(target.to_string()))?
    } else {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidTarget(target.to_string()))?;
        if host.contains(':') {
            return Err(Error::InvalidTarget(target.to_string()));
        }
        (host, port)
    };
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidTarget(target.to_string()))?;
    Ok((host.to_string(), port))
}

/// Append `:default_port` when the target has no port. A bare IPv6 literal
/// is bracketed on the way through.
pub(crate) fn ensure_port(target: &str, default_port: u16) -> String {
    if target.starts_with('[') {
        if target.contains("]:") {
            target.to_string()
        } else {
            format!("{target}:{default_port}")
        }
    } else if let Some((host, _)) = target.rsplit_once(':') {
        if host.contains(':') {
            // More than one colon and no brackets: bare IPv6 address.
            format!("[{target}]:{default_port}")
        } else {
            target.to_string()
        }
    } else {
        format!("{target}:{default_port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::node::parse_proxy_line;
    use tokio::net::TcpListener;

    #[test]
    fn test_split_target() {
        assert_eq!(
            split_target("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_target("[2001:db8::1]:80").unwrap(),
            ("2001:db8::1".to_string(), 80)
        );
        assert!(split_target("example.com").is_err());
        assert!(split_target("2001:db8::1:80").is_err());
    }

    #[test]
    fn test_ensure_port() {
        assert_eq!(ensure_port("example.com", 443), "example.com:443");
        assert_eq!(ensure_port("example.com:80", 443), "example.com:80");
        assert_eq!(ensure_port("[::1]", 443), "[::1]:443");
        assert_eq!(ensure_port("[::1]:80", 443), "[::1]:80");
        assert_eq!(ensure_port("2001:db8::1", 443), "[2001:db8::1]:443");
    }

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code("HTTP/1.1 200 Connection Established"), Some(200));
        assert_eq!(parse_status_code("HTTP/1.0 407 Auth Required"), Some(407));
        assert_eq!(parse_status_code("garbage"), None);
        assert_eq!(parse_status_code(""), None);
    }

    #[test]
    fn test_basic_auth() {
        assert_eq!(basic_auth("user", "pass"), "dXNlcjpwYXNz");
    }

    /// TCP echo server. Returns its address.
    async fn echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        let n = match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    /// Scripted SOCKS5 upstream: no-auth handshake, then connects to the
    /// requested target and relays.
    async fn mock_socks5_upstream() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ver = stream.read_u8().await.unwrap();
                    let nmethods = stream.read_u8().await.unwrap();
                    let mut methods = vec![0u8; nmethods as usize];
                    stream.read_exact(&mut methods).await.unwrap();
                    stream.write_all(&[0x05, 0x00]).await.unwrap();

                    let mut head = [0u8; 4];
                    stream.read_exact(&mut head).await.unwrap();
                    assert_eq!(head[1], 0x01, "CONNECT expected");
                    let target = match head[3] {
                        0x01 => {
                            let mut ip = [0u8; 4];
                            stream.read_exact(&mut ip).await.unwrap();
                            std::net::Ipv4Addr::from(ip).to_string()
                        }
                        0x03 => {
                            let len = stream.read_u8().await.unwrap() as usize;
                            let mut name = vec![0u8; len];
                            stream.read_exact(&mut name).await.unwrap();
                            String::from_utf8(name).unwrap()
                        }
                        other => panic!("unexpected atyp {other}"),
                    };
                    let port = stream.read_u16().await.unwrap();
                    let mut remote =
                        TcpStream::connect(format!("{target}:{port}")).await.unwrap();
                    stream
                        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                        .await
                        .unwrap();
                    let _ = tokio::io::copy_bidirectional(&mut stream, &mut remote).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_dial_via_socks5_round_trip() {
        let echo = echo_server().await;
        let upstream = mock_socks5_upstream().await;
        let node =
            parse_proxy_line(&format!("socks5://{upstream}"), "").expect("node parses");

        let mut stream =
            dial_via_proxy(&node, &echo.to_string(), Duration::from_secs(5))
                .await
                .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_dial_via_socks5_connect_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();
            // Swallow the request, reply host-unreachable.
            let mut req = vec![0u8; 10];
            let _ = stream.read(&mut req).await;
            stream
                .write_all(&[0x05, 0x04, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });
        let node = parse_proxy_line(&format!("socks5://{addr}"), "").unwrap();
        let err = dial_via_proxy(&node, "1.2.3.4:80", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Socks(_)), "got: {err}");
    }

    /// HTTP CONNECT upstream that rejects HTTP/1.1 with the given code and
    /// accepts the HTTP/1.0 retry, then relays to the requested target.
    async fn mock_http_connect_upstream(reject_code: u16) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 2048];
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
                    let text = String::from_utf8_lossy(&head);
                    let request_line = text.lines().next().unwrap_or("").to_string();
                    if request_line.ends_with("HTTP/1.1") {
                        let resp = format!("HTTP/1.1 {reject_code} Nope\r\n\r\n");
                        let _ = stream.write_all(resp.as_bytes()).await;
                        return;
                    }
                    assert!(
                        request_line.ends_with("HTTP/1.0"),
                        "unexpected request line: {request_line}"
                    );
                    assert!(
                        !text.to_ascii_lowercase().contains("proxy-connection"),
                        "fallback variant must not send Proxy-Connection"
                    );
                    let target = request_line
                        .split_whitespace()
                        .nth(1)
                        .unwrap()
                        .to_string();
                    let mut remote = TcpStream::connect(&target).await.unwrap();
                    stream
                        .write_all(b"HTTP/1.0 200 Connection Established\r\n\r\n")
                        .await
                        .unwrap();
                    let _ = tokio::io::copy_bidirectional(&mut stream, &mut remote).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_http_connect_variant_fallback() {
        let echo = echo_server().await;
        let upstream = mock_http_connect_upstream(400).await;
        let node = parse_proxy_line(&format!("http://{upstream}"), "").unwrap();

        let mut stream =
            dial_via_proxy(&node, &echo.to_string(), Duration::from_secs(5))
                .await
                .unwrap();
        stream.write_all(b"fallback ok").await.unwrap();
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"fallback ok");
    }

    #[tokio::test]
    async fn test_http_connect_no_fallback_on_other_codes() {
        // 403 is not in the fallback set; the dial must fail with the
        // structured error from variant 1.
        let upstream = mock_http_connect_upstream(403).await;
        let node = parse_proxy_line(&format!("http://{upstream}"), "").unwrap();

        let err = dial_via_proxy(&node, "1.2.3.4:80", Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            Error::HttpConnect { code, .. } => assert_eq!(code, 403),
            other => panic!("expected HttpConnect error, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_http_connect_success_first_variant() {
        let echo = echo_server().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 2048];
            let mut head = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                head.extend_from_slice(&buf[..n]);
                if head.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let text = String::from_utf8_lossy(&head);
            let target = text
                .lines()
                .next()
                .unwrap()
                .split_whitespace()
                .nth(1)
                .unwrap()
                .to_string();
            let mut remote = TcpStream::connect(&target).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 Connection Established\r\nX-Proxy: mock\r\n\r\n")
                .await
                .unwrap();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut remote).await;
        });
        let node = parse_proxy_line(&format!("http://{addr}"), "").unwrap();
        let mut stream =
            dial_via_proxy(&node, &echo.to_string(), Duration::from_secs(5))
                .await
                .unwrap();
        stream.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_dial_direct_timeout() {
        // RFC 5737 TEST-NET address: connect attempts black-hole.
        let err = dial_direct("192.0.2.1:81", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout | Error::Io(_)), "got: {err}");
    }
}
