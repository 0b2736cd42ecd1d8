//! Local SOCKS5 listener (RFC 1928, CONNECT only, no downstream auth).
//!
//! The listener's only real contribution is the dial callback: the target
//! requested by the client is dialed through the upstream pool, with
//! failure reporting and a direct-dial fallback when the pool is empty.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use slog_scope::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::pool::manager::ProxyManager;
use crate::pool::node::ProxyKind;

use super::dial_pool_upstream;

// SOCKS5 constants
const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

pub struct Socks5Server {
    manager: Arc<ProxyManager>,
    /// Advance the pool cursor for every accepted connection instead of
    /// sticking to the current selection.
    rotate_per_conn: bool,
    dial_timeout: Duration,
}

impl Socks5Server {
    #[must_use]
    pub fn new(manager: Arc<ProxyManager>, rotate_per_conn: bool, dial_timeout: Duration) -> Self {
        Self {
            manager,
            rotate_per_conn,
            dial_timeout,
        }
    }

    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let label = if self.rotate_per_conn {
            "socks5-auto"
        } else {
            "socks5"
        };
        let local_addr = listener.local_addr()?;
        info!(
            "socks5_listener_started";
            "listen_addr" => local_addr.to_string(),
            "mode" => label
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(
                                "socks5_connection_accepted";
                                "listener" => label,
                                "peer_addr" => peer.to_string()
                            );
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle(stream).await {
                                    debug!(
                                        "socks5_connection_error";
                                        "listener" => label,
                                        "error" => e.to_string()
                                    );
                                }
                            });
                        }
                        Err(e) => {
                            warn!(
                                "socks5_accept_error";
                                "listener" => label,
                                "error" => e.to_string()
                            );
                        }
                    }
                }
            }
        }
    }

    async fn handle(&self, mut client: TcpStream) -> anyhow::Result<()> {
        // 1. Greeting: client sends version + method list
        let ver = client.read_u8().await?;
        if ver != SOCKS_VERSION {
            anyhow::bail!("unsupported SOCKS version: {}", ver);
        }
        let nmethods = client.read_u8().await?;
        let mut methods = vec![0u8; nmethods as usize];
        client.read_exact(&mut methods).await?;

        // Downstream clients are not authenticated.
        if !methods.contains(&AUTH_NONE) {
            client.write_all(&[SOCKS_VERSION, 0xFF]).await?;
            anyhow::bail!("client does not support no-auth");
        }
        client.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;

        // 2. Request: VER CMD RSV ATYP DST.ADDR DST.PORT
        let ver = client.read_u8().await?;
        if ver != SOCKS_VERSION {
            anyhow::bail!("unexpected version in request: {}", ver);
        }
        let cmd = client.read_u8().await?;
        let _rsv = client.read_u8().await?;
        let atyp = client.read_u8().await?;

        if cmd != CMD_CONNECT {
            send_reply(&mut client, REP_CMD_NOT_SUPPORTED).await?;
            anyhow::bail!("unsupported SOCKS command: {}", cmd);
        }

        let addr = match atyp {
            ATYP_IPV4 => {
                let mut buf = [0u8; 4];
                client.read_exact(&mut buf).await?;
                Ipv4Addr::from(buf).to_string()
            }
            ATYP_DOMAIN => {
                let len = client.read_u8().await? as usize;
                let mut buf = vec![0u8; len];
                client.read_exact(&mut buf).await?;
                String::from_utf8(buf)?
            }
            ATYP_IPV6 => {
                let mut buf = [0u8; 16];
                client.read_exact(&mut buf).await?;
                format!("[{}]", Ipv6Addr::from(buf))
            }
            _ => {
                send_reply(&mut client, REP_ATYP_NOT_SUPPORTED).await?;
                anyhow::bail!("unsupported address type: {}", atyp);
            }
        };

        let port = client.read_u16().await?;
        let target = format!("{addr}:{port}");
        debug!("socks5_connect"; "target" => target.as_str());

        // 3. Dial the target through the upstream pool.
        match dial_pool_upstream(
            &self.manager,
            ProxyKind::Socks5,
            self.rotate_per_conn,
            &target,
            self.dial_timeout,
            true,
        )
        .await
        {
            Ok(mut remote) => {
                send_reply(&mut client, REP_SUCCESS).await?;
                if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut remote).await {
                    debug!("socks5_tunnel_closed"; "error" => e.to_string());
                }
            }
            Err(e) => {
                warn!(
                    "socks5_upstream_dial_failed";
                    "target" => target.as_str(),
                    "error" => e.to_string()
                );
                send_reply(&mut client, REP_GENERAL_FAILURE).await?;
            }
        }

        Ok(())
    }
}

async fn send_reply(client: &mut TcpStream, rep: u8) -> anyhow::Result<()> {
    // VER REP RSV ATYP BND.ADDR BND.PORT
    let reply = [
        SOCKS_VERSION,
        rep,
        0x00, // RSV
        ATYP_IPV4,
        0, 0, 0, 0, // BND.ADDR (0.0.0.0)
        0, 0, // BND.PORT (0)
    ];
    client.write_all(&reply).await?;
    Ok(())
}
