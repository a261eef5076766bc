// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::env;

use crate::error::ConfigError;

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key() -> String {
    "ENV".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiConfig {
    /// "openai" | "mock" | "disabled" (case-insensitive)
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Used for the last attempt when earlier attempts could not be parsed.
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// "ENV" means: read from OPENAI_API_KEY
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            fallback_model: None,
            base_url: default_base_url(),
            api_key: default_api_key(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl AiConfig {
    /// Normalize the provider name and resolve an `ENV` api key.
    pub fn resolve(mut self) -> Result<Self, ConfigError> {
        self.provider = self.provider.trim().to_lowercase();

        match self.provider.as_str() {
            "openai" | "mock" | "disabled" => {}
            other => {
                return Err(ConfigError::InvalidSetting {
                    field: "ai.provider",
                    reason: format!("unsupported provider {other:?} (openai, mock, disabled)"),
                })
            }
        }

        if self.provider == "openai" && self.api_key.trim().eq_ignore_ascii_case("env") {
            self.api_key = env::var("OPENAI_API_KEY").map_err(|_| ConfigError::InvalidSetting {
                field: "ai.api_key",
                reason: "Missing OPENAI_API_KEY env var".into(),
            })?;
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "ai.timeout_secs",
                reason: "must be > 0".into(),
            });
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidSetting {
                field: "ai.max_attempts",
                reason: "must be >= 1".into(),
            });
        }
        Ok(self)
    }

    pub fn is_enabled(&self) -> bool {
        !self.provider.trim().eq_ignore_ascii_case("disabled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[serial_test::serial]
    #[test]
    fn env_key_is_resolved_for_openai() {
        env::set_var("OPENAI_API_KEY", "sk-test");
        let cfg = AiConfig {
            provider: "OpenAI".into(),
            ..Default::default()
        }
        .resolve()
        .unwrap();
        assert_eq!(cfg.provider, "openai");
        assert_eq!(cfg.api_key, "sk-test");
        env::remove_var("OPENAI_API_KEY");
    }

    #[serial_test::serial]
    #[test]
    fn missing_env_key_fails_fast() {
        env::remove_var("OPENAI_API_KEY");
        let err = AiConfig {
            provider: "openai".into(),
            ..Default::default()
        }
        .resolve()
        .unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn unknown_provider_rejected() {
        let err = AiConfig {
            provider: "claude".into(),
            ..Default::default()
        }
        .resolve()
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting { field: "ai.provider", .. }));
    }
}
