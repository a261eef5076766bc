// src/config/feed.rs
//! Validated, immutable description of one feed source.

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConfigError;
use crate::ingest::parser::ParserOptions;
use crate::ingest::types::FeedId;

fn default_enabled() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retries() -> u32 {
    2
}
fn default_interval_secs() -> u64 {
    900
}

/// Wire form of [`FeedConfig`], as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFeedConfig {
    pub id: FeedId,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parser_options: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
}

impl RawFeedConfig {
    pub fn new(id: FeedId, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            enabled: default_enabled(),
            timeout_secs: default_timeout_secs(),
            retries: default_retries(),
            interval_secs: default_interval_secs(),
            headers: BTreeMap::new(),
            parser_options: BTreeMap::new(),
            proxy: None,
        }
    }
}

/// Constructed once at load time through [`FeedConfig::new`]; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFeedConfig", into = "RawFeedConfig")]
pub struct FeedConfig {
    id: FeedId,
    url: String,
    enabled: bool,
    timeout: Duration,
    retries: u32,
    interval: Duration,
    headers: BTreeMap<String, String>,
    parser_options: BTreeMap<String, String>,
    parsed_options: ParserOptions,
    proxy: Option<String>,
}

impl FeedConfig {
    pub fn new(raw: RawFeedConfig) -> Result<Self, ConfigError> {
        let id = raw.id;
        if id <= 0 {
            return Err(ConfigError::InvalidId(id));
        }

        let url = Url::parse(raw.url.trim()).map_err(|e| ConfigError::InvalidUrl {
            id,
            url: raw.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme {
                id,
                scheme: url.scheme().to_string(),
            });
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ConfigError::InvalidUrl {
                id,
                url: raw.url.clone(),
                reason: "missing host".into(),
            });
        }

        if raw.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout { id });
        }

        for (name, value) in &raw.headers {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConfigError::InvalidHeader {
                id,
                name: name.clone(),
                reason: e.to_string(),
            })?;
            HeaderValue::from_str(value).map_err(|e| ConfigError::InvalidHeader {
                id,
                name: name.clone(),
                reason: e.to_string(),
            })?;
        }

        let parsed_options =
            ParserOptions::from_map(&raw.parser_options).map_err(|reason| {
                ConfigError::InvalidSetting {
                    field: "feeds.parser_options",
                    reason: format!("feed {id}: {reason}"),
                }
            })?;

        let proxy = match raw.proxy {
            Some(p) if !p.trim().is_empty() => {
                let parsed = Url::parse(p.trim()).map_err(|e| ConfigError::InvalidProxy {
                    id,
                    proxy: p.clone(),
                    reason: e.to_string(),
                })?;
                if !matches!(parsed.scheme(), "http" | "https" | "socks5" | "socks5h") {
                    return Err(ConfigError::InvalidProxy {
                        id,
                        proxy: p,
                        reason: format!("unsupported scheme {}", parsed.scheme()),
                    });
                }
                Some(p.trim().to_string())
            }
            _ => None,
        };

        Ok(Self {
            id,
            url: raw.url.trim().to_string(),
            enabled: raw.enabled,
            timeout: Duration::from_secs(raw.timeout_secs),
            retries: raw.retries,
            interval: Duration::from_secs(raw.interval_secs),
            headers: raw.headers,
            parser_options: raw.parser_options,
            parsed_options,
            proxy,
        })
    }

    pub fn id(&self) -> FeedId {
        self.id
    }
    pub fn url(&self) -> &str {
        &self.url
    }
    pub fn enabled(&self) -> bool {
        self.enabled
    }
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
    pub fn retries(&self) -> u32 {
        self.retries
    }
    pub fn interval(&self) -> Duration {
        self.interval
    }
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }
    pub fn parser_options(&self) -> &ParserOptions {
        &self.parsed_options
    }
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }
}

impl TryFrom<RawFeedConfig> for FeedConfig {
    type Error = ConfigError;

    fn try_from(raw: RawFeedConfig) -> Result<Self, Self::Error> {
        FeedConfig::new(raw)
    }
}

impl From<FeedConfig> for RawFeedConfig {
    fn from(c: FeedConfig) -> Self {
        Self {
            id: c.id,
            url: c.url,
            enabled: c.enabled,
            timeout_secs: c.timeout.as_secs(),
            retries: c.retries,
            interval_secs: c.interval.as_secs(),
            headers: c.headers,
            parser_options: c.parser_options,
            proxy: c.proxy,
        }
    }
}
