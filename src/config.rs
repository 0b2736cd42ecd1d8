//! JSON configuration. A config file, when given, overrides CLI flags
//! wholesale; defaults are applied after load and validated before use.

use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::pool::fetch::{default_sources, ProxySource};
use crate::pool::validate::ValidationConfig;

pub const DEFAULT_SOCKS_LISTEN: &str = "127.0.0.1:1080";
pub const DEFAULT_HTTP_LISTEN: &str = "127.0.0.1:18080";
pub const DEFAULT_WEB_LISTEN: &str = "127.0.0.1:8088";
pub const DEFAULT_REFRESH_EVERY: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_ROTATE_EVERY: Duration = Duration::from_secs(30);
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// A duration that deserializes from either a humantime string ("30m") or a
/// number of seconds. Zero disables the timer it configures; an absent field
/// gets the default instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = ConfigDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration string like \"30m\" or a number of seconds")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
                let v = v.trim();
                if v.is_empty() || v == "0" {
                    return Ok(ConfigDuration(Duration::ZERO));
                }
                humantime::parse_duration(v)
                    .map(ConfigDuration)
                    .map_err(E::custom)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
                Ok(ConfigDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
                if v < 0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(ConfigDuration(Duration::from_secs(v as u64)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Self::Value, E> {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("duration cannot be negative"));
                }
                Ok(ConfigDuration(Duration::from_secs_f64(v)))
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
                Ok(ConfigDuration(Duration::ZERO))
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socks_listen: String,
    pub web_listen: String,
    /// Local HTTP proxy listener; empty disables it.
    pub http_listen: String,
    /// Second SOCKS5 listener that rotates upstream per connection; empty
    /// disables it.
    pub socks_auto_listen: String,

    pub refresh_every: Option<ConfigDuration>,
    pub rotate_every: Option<ConfigDuration>,
    pub dial_timeout: Option<ConfigDuration>,

    pub sources: Option<Vec<ProxySource>>,
    pub proxies: Vec<String>,
    pub validation: ValidationConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&raw)?;
        Ok(cfg)
    }

    pub fn apply_defaults(&mut self) {
        if self.socks_listen.is_empty() {
            self.socks_listen = DEFAULT_SOCKS_LISTEN.to_string();
        }
        if self.web_listen.is_empty() {
            self.web_listen = DEFAULT_WEB_LISTEN.to_string();
        }
        if self.refresh_every.is_none() {
            self.refresh_every = Some(ConfigDuration(DEFAULT_REFRESH_EVERY));
        }
        if self.rotate_every.is_none() {
            self.rotate_every = Some(ConfigDuration(DEFAULT_ROTATE_EVERY));
        }
        if self.dial_timeout.is_none() {
            self.dial_timeout = Some(ConfigDuration(DEFAULT_DIAL_TIMEOUT));
        }
        if self.sources.is_none() {
            self.sources = Some(default_sources());
        }
        self.validation.apply_defaults();
    }

    pub fn validate(&self) -> Result<()> {
        if self.socks_listen.is_empty() {
            return Err(Error::Config("socks_listen is empty".to_string()));
        }
        if self.web_listen.is_empty() {
            return Err(Error::Config("web_listen is empty".to_string()));
        }
        let Some(sources) = &self.sources else {
            return Err(Error::Config("sources is missing".to_string()));
        };
        for (i, source) in sources.iter().enumerate() {
            if source.url.is_empty() {
                return Err(Error::Config(format!("sources[{i}].url is empty")));
            }
            source
                .validate()
                .map_err(|e| Error::Config(format!("sources[{i}]: {e}")))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn refresh_every(&self) -> Duration {
        self.refresh_every.map(|d| d.0).unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn rotate_every(&self) -> Duration {
        self.rotate_every.map(|d| d.0).unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        let d = self.dial_timeout.map(|d| d.0).unwrap_or(Duration::ZERO);
        if d.is_zero() {
            DEFAULT_DIAL_TIMEOUT
        } else {
            d
        }
    }
}
