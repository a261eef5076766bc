// src/config/mod.rs
//! Typed configuration. One TOML file, validated fail-fast by [`load_config`].

pub mod ai;
pub mod feed;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

pub use ai::AiConfig;
pub use feed::{FeedConfig, RawFeedConfig};

use crate::error::ConfigError;
use crate::ingest::state::BackoffPolicy;

pub const ENV_CONFIG_PATH: &str = "FEEDGATE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/feedgate.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// "sqlite" | "memory"
    pub backend: String,
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            path: PathBuf::from("data/feedgate.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Feeds fetched in parallel.
    pub concurrency: usize,
    pub user_agent: String,
    pub max_body_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            user_agent: concat!("feedgate/", env!("CARGO_PKG_VERSION")).to_string(),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizeConfig {
    /// Inline prompt template; wins over `prompt_path`.
    pub prompt: Option<String>,
    pub prompt_path: Option<PathBuf>,
    /// Items analyzed in parallel.
    pub concurrency: usize,
    /// Max unprocessed items picked up per run.
    pub batch_limit: usize,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            prompt: None,
            prompt_path: None,
            concurrency: 4,
            batch_limit: 200,
            temperature: 0.2,
            max_tokens: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Similarity (0-100) at or above which a candidate is a duplicate.
    pub threshold: u8,
    pub window_hours: u64,
    pub window_size: usize,
    /// Title similarity (0.0-1.0) treated as a certain duplicate without asking the AI.
    pub lexical_shortcut: f64,
    /// Defaults to `ai.model`.
    pub model: Option<String>,
    pub batch_limit: usize,
    /// Passes without a usable AI answer before an item is withheld for good.
    pub max_failed_runs: u32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: 80,
            window_hours: 48,
            window_size: 30,
            lexical_shortcut: 0.95,
            model: None,
            batch_limit: 200,
            max_failed_runs: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// "log" | "discord" | "slack"
    pub sink: String,
    /// Discord webhook url, Slack channel id, or a free label for "log".
    pub target: String,
    /// Slack bot token; "ENV" reads SLACK_BOT_TOKEN.
    pub token: String,
    /// Items scored below this are never published.
    pub min_importance: u8,
    pub retention_days: u64,
    pub batch_limit: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            sink: "log".to_string(),
            target: "stdout".to_string(),
            token: "ENV".to_string(),
            min_importance: 1,
            retention_days: 30,
            batch_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub ai: AiConfig,
    #[serde(default)]
    pub summarize: SummarizeConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

impl AppConfig {
    /// Cross-field checks that serde cannot express.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        self.backoff.validate()?;
        self.ai = self.ai.resolve()?;

        let mut seen = HashSet::new();
        for f in &self.feeds {
            if !seen.insert(f.id()) {
                return Err(ConfigError::DuplicateFeedId(f.id()));
            }
        }

        match self.store.backend.as_str() {
            "sqlite" | "memory" => {}
            other => {
                return Err(ConfigError::InvalidSetting {
                    field: "store.backend",
                    reason: format!("unsupported backend {other:?} (sqlite, memory)"),
                })
            }
        }

        if self.runner.concurrency == 0 {
            return Err(invalid("runner.concurrency", "must be >= 1"));
        }
        if self.summarize.concurrency == 0 {
            return Err(invalid("summarize.concurrency", "must be >= 1"));
        }
        if self.dedup.threshold > 100 {
            return Err(invalid("dedup.threshold", "must be within 0..=100"));
        }
        if self.dedup.window_size == 0 {
            return Err(invalid("dedup.window_size", "must be >= 1"));
        }
        if self.dedup.max_failed_runs == 0 {
            return Err(invalid("dedup.max_failed_runs", "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&self.dedup.lexical_shortcut) {
            return Err(invalid("dedup.lexical_shortcut", "must be within 0.0..=1.0"));
        }
        if !(1..=20).contains(&self.publish.min_importance) {
            return Err(invalid("publish.min_importance", "must be within 1..=20"));
        }

        self.publish.sink = self.publish.sink.trim().to_lowercase();
        match self.publish.sink.as_str() {
            "log" => {}
            "discord" => {
                if !self.publish.target.starts_with("https://") {
                    return Err(invalid(
                        "publish.target",
                        "discord sink needs the webhook url as target",
                    ));
                }
            }
            "slack" => {
                if self.publish.token.trim().eq_ignore_ascii_case("env") {
                    self.publish.token = std::env::var("SLACK_BOT_TOKEN")
                        .map_err(|_| invalid("publish.token", "Missing SLACK_BOT_TOKEN env var"))?;
                }
                if self.publish.target.trim().is_empty() {
                    return Err(invalid("publish.target", "slack sink needs a channel id"));
                }
            }
            other => {
                return Err(ConfigError::InvalidSetting {
                    field: "publish.sink",
                    reason: format!("unsupported sink {other:?} (log, discord, slack)"),
                })
            }
        }

        Ok(self)
    }

    /// Summarization prompt text: inline, then file, then built-in.
    pub fn prompt_template(&self) -> Result<Option<String>> {
        if let Some(p) = &self.summarize.prompt {
            return Ok(Some(p.clone()));
        }
        match &self.summarize.prompt_path {
            Some(path) => fs::read_to_string(path)
                .map(Some)
                .with_context(|| format!("reading prompt template {}", path.display())),
            None => Ok(None),
        }
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        field,
        reason: reason.to_string(),
    }
}

/// Parse and validate a config from TOML text.
pub fn parse_config(s: &str) -> Result<AppConfig> {
    let raw: AppConfig = toml::from_str(s).context("Failed to parse config file")?;
    Ok(raw.validate()?)
}

/// Load config from an explicit path.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Invalid config: {}", path.display()))
}

/// Resolve the config path: explicit argument, then $FEEDGATE_CONFIG, then the default path.
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok(pb);
        }
        return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[ai]
provider = "mock"

[[feeds]]
id = 1
url = "https://a.test/rss"

[[feeds]]
id = 2
url = "https://b.test/atom"
enabled = false
headers = { "User-Agent" = "custom" }
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.feeds.len(), 2);
        assert_eq!(cfg.backoff, BackoffPolicy::default());
        assert_eq!(cfg.dedup.threshold, 80);
        assert_eq!(cfg.dedup.max_failed_runs, 3);
        assert_eq!(cfg.publish.sink, "log");
        assert!(!cfg.feeds[1].enabled());
        assert_eq!(cfg.feeds[1].headers().get("User-Agent").unwrap(), "custom");
    }

    #[test]
    fn duplicate_feed_ids_rejected() {
        let s = r#"
[ai]
provider = "disabled"
[[feeds]]
id = 1
url = "https://a.test/rss"
[[feeds]]
id = 1
url = "https://b.test/rss"
"#;
        let err = parse_config(s).unwrap_err();
        assert!(format!("{err:#}").contains("duplicate feed id 1"));
    }

    #[test]
    fn bad_feed_url_fails_the_load() {
        let s = r#"
[[feeds]]
id = 4
url = "gopher://old.test/"
"#;
        let err = parse_config(s).unwrap_err();
        assert!(format!("{err:#}").contains("unsupported url scheme"));
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let s = r#"
[dedup]
threshold = 150
"#;
        assert!(parse_config(s).is_err());
    }

    #[test]
    fn dedup_needs_at_least_one_pass() {
        let s = r#"
[dedup]
max_failed_runs = 0
"#;
        let err = parse_config(s).unwrap_err();
        assert!(format!("{err:#}").contains("dedup.max_failed_runs"));
    }
}
