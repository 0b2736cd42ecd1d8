use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use slog_scope::{error, info};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use poolmux::cli::Cli;
use poolmux::config::{Config, ConfigDuration};
use poolmux::logging;
use poolmux::pool::manager::ProxyManager;
use poolmux::pool::node::ProxyKind;
use poolmux::pool::refresh::Refresher;
use poolmux::server::http::HttpProxyServer;
use poolmux::server::socks5::Socks5Server;
use poolmux::server::web::{self, WebState};

fn main() {
    let cli = Cli::parse();
    logging::init_terminal(cli.verbose);

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("config_load_failed"; "error" => format!("{e:#}"));
            std::process::exit(1);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("tokio_runtime_build_failed"; "error" => e.to_string());
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(run(config)) {
        error!("startup_failed"; "error" => format!("{e:#}"));
        std::process::exit(1);
    }
}

/// A config file, when given, overrides the flags wholesale; otherwise the
/// flags are folded into a config document.
fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => Config {
            socks_listen: cli.socks.clone(),
            http_listen: cli.http.clone(),
            socks_auto_listen: cli.socks_auto.clone(),
            web_listen: cli.web.clone(),
            refresh_every: Some(ConfigDuration(cli.refresh_every)),
            rotate_every: Some(ConfigDuration(cli.rotate_every)),
            dial_timeout: Some(ConfigDuration(cli.dial_timeout)),
            ..Config::default()
        },
    };
    config.apply_defaults();
    config.validate().context("invalid config")?;
    Ok(config)
}

async fn run(config: Config) -> anyhow::Result<()> {
    let dial_timeout = config.dial_timeout();

    // The fixed manager backs the sticky listeners and the API; the auto
    // manager exists only when the per-connection rotating listener is on.
    let fixed = Arc::new(ProxyManager::new());
    let auto = if config.socks_auto_listen.is_empty() {
        None
    } else {
        Some(Arc::new(ProxyManager::new()))
    };

    let mut managers = vec![Arc::clone(&fixed)];
    if let Some(auto) = &auto {
        managers.push(Arc::clone(auto));
    }
    let refresher = Arc::new(Refresher::new(
        managers,
        config.sources.clone().unwrap_or_default(),
        config.proxies.clone(),
        config.validation.clone(),
        dial_timeout,
    )?);

    let shutdown = CancellationToken::new();
    let mut servers = JoinSet::new();

    // Pool refresh: best-effort initial cycle, then the timer.
    {
        let refresher = Arc::clone(&refresher);
        let shutdown = shutdown.clone();
        let every = config.refresh_every();
        tokio::spawn(async move {
            let _ = refresher.refresh().await;
            if every.is_zero() {
                return;
            }
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        let _ = refresher.refresh().await;
                    }
                }
            }
        });
    }

    // Sticky-pool rotation timer.
    if !config.rotate_every().is_zero() {
        let fixed = Arc::clone(&fixed);
        let shutdown = shutdown.clone();
        let every = config.rotate_every();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Some(node) = fixed.next(ProxyKind::Socks5) {
                            info!("rotated_socks5_upstream"; "proxy" => node.to_string());
                        }
                        if let Some(node) = fixed.next(ProxyKind::Http) {
                            info!("rotated_http_upstream"; "proxy" => node.to_string());
                        }
                    }
                }
            }
        });
    }

    // Fixed SOCKS5 listener.
    {
        let listener = TcpListener::bind(&config.socks_listen)
            .await
            .with_context(|| format!("listen socks5 {}", config.socks_listen))?;
        let server = Arc::new(Socks5Server::new(Arc::clone(&fixed), false, dial_timeout));
        servers.spawn(server.serve(listener, shutdown.clone()));
    }

    // Optional per-connection rotating SOCKS5 listener.
    if let Some(auto_manager) = &auto {
        let listener = TcpListener::bind(&config.socks_auto_listen)
            .await
            .with_context(|| format!("listen socks5-auto {}", config.socks_auto_listen))?;
        let server = Arc::new(Socks5Server::new(
            Arc::clone(auto_manager),
            true,
            dial_timeout,
        ));
        servers.spawn(server.serve(listener, shutdown.clone()));
    }

    // Optional local HTTP proxy listener.
    if !config.http_listen.is_empty() {
        let listener = TcpListener::bind(&config.http_listen)
            .await
            .with_context(|| format!("listen http proxy {}", config.http_listen))?;
        let server = Arc::new(HttpProxyServer::new(Arc::clone(&fixed), dial_timeout));
        servers.spawn(server.serve(listener, shutdown.clone()));
    }

    // Control API.
    {
        let listener = TcpListener::bind(&config.web_listen)
            .await
            .with_context(|| format!("listen web {}", config.web_listen))?;
        let state = Arc::new(WebState {
            fixed: Arc::clone(&fixed),
            auto: auto.clone(),
            refresher: Arc::clone(&refresher),
            dial_timeout,
        });
        servers.spawn(web::serve(listener, state, shutdown.clone()));
    }

    tokio::select! {
        _ = wait_for_signal() => {
            info!("shutdown_signal_received");
        }
        Some(finished) = servers.join_next() => {
            match finished {
                Ok(Err(e)) => error!("server_failed"; "error" => format!("{e:#}")),
                Err(e) => error!("server_panicked"; "error" => e.to_string()),
                Ok(Ok(())) => {}
            }
        }
    }

    shutdown.cancel();
    let drain = async {
        while servers.join_next().await.is_some() {}
    };
    let _ = tokio::time::timeout(Duration::from_secs(5), drain).await;
    info!("shutdown_complete");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
