use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("empty proxy list")]
    EmptyPool,

    #[error("no valid proxies found")]
    NoValidProxies,

    #[error("socks5 handshake failed: {0}")]
    Socks(String),

    #[error("proxy connect failed: proxy={proxy} target={target} code={code} {status_line}")]
    HttpConnect {
        proxy: String,
        target: String,
        code: u16,
        status_line: String,
    },

    #[error("invalid target address: {0}")]
    InvalidTarget(String),

    #[error("check failed: http status {0}")]
    CheckStatus(u16),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("operation timed out")]
    Timeout,

    #[error("invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
