use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser)]
#[command(
    name = "poolmux",
    about = "Local SOCKS5/HTTP proxy multiplexer over a rotating pool of public upstreams",
    version = env!("POOLMUX_BUILD_VERSION")
)]
pub struct Cli {
    /// Local SOCKS5 listen address
    #[arg(long, default_value = crate::config::DEFAULT_SOCKS_LISTEN)]
    pub socks: String,

    /// Local HTTP proxy listen address (empty disables)
    #[arg(long, default_value = crate::config::DEFAULT_HTTP_LISTEN)]
    pub http: String,

    /// Second SOCKS5 listener that rotates upstream per connection (empty disables)
    #[arg(long = "socks-auto", default_value = "")]
    pub socks_auto: String,

    /// Web API listen address
    #[arg(long, default_value = crate::config::DEFAULT_WEB_LISTEN)]
    pub web: String,

    /// Proxy pool refresh interval, e.g. "30m" (0 disables)
    #[arg(long = "refresh-every", default_value = "30m", value_parser = parse_duration_flag)]
    pub refresh_every: Duration,

    /// Sticky-pool rotation interval, e.g. "30s" (0 disables)
    #[arg(long = "rotate-every", default_value = "30s", value_parser = parse_duration_flag)]
    pub rotate_every: Duration,

    /// Upstream dial timeout
    #[arg(long = "dial-timeout", default_value = "15s", value_parser = parse_duration_flag)]
    pub dial_timeout: Duration,

    /// Path to JSON config (overrides flags when set)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_duration_flag(s: &str) -> Result<Duration, String> {
    if s.trim() == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(s.trim()).map_err(|e| e.to_string())
}
