// src/analyze/ai_adapter.rs
//! AI adapter: provider abstraction for "prompt in, text out".
//! Retries, fallback models and parsing live in the services; a client makes one call.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::AiConfig;

/// Per-call knobs chosen by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            max_tokens: 600,
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
pub trait AiClient: Send + Sync {
    /// One completion. `Err` is an API or transport failure, not a bad answer.
    async fn complete(&self, prompt: &str, model: &str, opts: &CompletionOptions)
        -> Result<String>;
    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
    /// `false` when every call is known to fail; callers then leave work unclaimed.
    fn is_enabled(&self) -> bool {
        true
    }
}

pub type DynAiClient = Arc<dyn AiClient>;

/// Factory: build a client from a resolved [`AiConfig`].
pub fn build_client_from_config(cfg: &AiConfig) -> Result<DynAiClient> {
    if !cfg.is_enabled() {
        return Ok(Arc::new(DisabledClient));
    }
    Ok(match cfg.provider.as_str() {
        "openai" => Arc::new(OpenAiClient::new(&cfg.base_url, &cfg.api_key)?),
        "mock" => Arc::new(MockClient::offline()),
        _ => Arc::new(DisabledClient),
    })
}

// ------------------------------------------------------------
// OpenAI
// ------------------------------------------------------------

const SYSTEM_PROMPT: &str =
    "You are a careful news desk editor. Answer with a single JSON object and nothing else.";

/// Chat Completions client. Works with any OpenAI-compatible base url.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl OpenAiClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("feedgate/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .build()
            .context("building AI http client")?;
        Ok(Self {
            http,
            api_key: api_key.to_string(),
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
        })
    }
}

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Msg<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMsg,
}

#[derive(Deserialize)]
struct ChoiceMsg {
    content: Option<String>,
}

#[async_trait]
impl AiClient for OpenAiClient {
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        opts: &CompletionOptions,
    ) -> Result<String> {
        if self.api_key.is_empty() {
            bail!("OpenAI api key is empty");
        }
        let req = ChatRequest {
            model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: opts.temperature,
            max_tokens: opts.max_tokens,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(opts.timeout)
            .json(&req)
            .send()
            .await
            .context("openai request")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!(
                "openai HTTP {status}: {}",
                sanitize_reason(&body, 200)
            );
        }
        let body: ChatResponse = resp.json().await.context("openai response body")?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow!("openai returned no content"))
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

// ------------------------------------------------------------
// Disabled + mock
// ------------------------------------------------------------

/// Always fails; used when `ai.provider = "disabled"`.
pub struct DisabledClient;

#[async_trait]
impl AiClient for DisabledClient {
    async fn complete(&self, _prompt: &str, _model: &str, _opts: &CompletionOptions) -> Result<String> {
        Err(anyhow!("AI provider is disabled"))
    }
    fn provider_name(&self) -> &'static str {
        "disabled"
    }
    fn is_enabled(&self) -> bool {
        false
    }
}

/// Scripted client for tests and offline runs.
///
/// Replies are taken from the script in order (`Err` entries simulate API
/// failures). When the script is empty, an offline client answers with a
/// neutral canned reply; a scripted client fails.
pub struct MockClient {
    script: Mutex<VecDeque<Result<String, String>>>,
    offline: bool,
    calls: Mutex<Vec<MockCall>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub model: String,
    pub prompt: String,
}

impl MockClient {
    pub fn scripted<I>(replies: I) -> Self
    where
        I: IntoIterator<Item = Result<String, String>>,
    {
        Self {
            script: Mutex::new(replies.into_iter().collect()),
            offline: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn offline() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            offline: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(Ok(reply.into()));
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or_default()
    }
}

fn offline_reply(prompt: &str) -> String {
    if prompt.contains("\"similarity\"") {
        r#"{"similarity": 0, "matched_index": null, "reason": "offline mock"}"#.to_string()
    } else {
        r#"{"language": "en", "importance": 10, "category": "general", "summary": "Offline mock summary."}"#
            .to_string()
    }
}

#[async_trait]
impl AiClient for MockClient {
    async fn complete(&self, prompt: &str, model: &str, _opts: &CompletionOptions) -> Result<String> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(MockCall {
                model: model.to_string(),
                prompt: prompt.to_string(),
            });
        }
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("mock script poisoned"))?
            .pop_front();
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(anyhow!(e)),
            None if self.offline => Ok(offline_reply(prompt)),
            None => Err(anyhow!("mock script exhausted")),
        }
    }
    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

// ------------------------------------------------------------
// Sanitization
// ------------------------------------------------------------

/// Single line, collapsed whitespace, at most `max` chars.
pub fn sanitize_reason(input: &str, max: usize) -> String {
    let mut out = String::with_capacity(max.min(input.len()));
    let mut prev_space = false;
    let mut n = 0;
    for ch in input.chars() {
        let c = if ch.is_whitespace() || ch.is_control() {
            ' '
        } else {
            ch
        };
        if c == ' ' {
            if !prev_space && !out.is_empty() {
                out.push(' ');
                n += 1;
            }
            prev_space = true;
        } else {
            out.push(c);
            n += 1;
            prev_space = false;
        }
        if n >= max {
            break;
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_and_truncates() {
        assert_eq!(sanitize_reason("  a\n\tb   c ", 160), "a b c");
        assert_eq!(sanitize_reason("abcdef", 3), "abc");
    }

    #[tokio::test]
    async fn scripted_mock_replays_then_fails() {
        let m = MockClient::scripted([Ok("one".to_string()), Err("boom".to_string())]);
        let o = CompletionOptions::default();
        assert_eq!(m.complete("p", "m1", &o).await.unwrap(), "one");
        assert!(m.complete("p", "m1", &o).await.is_err());
        assert!(m.complete("p", "m1", &o).await.is_err());
        assert_eq!(m.call_count(), 3);
    }

    #[tokio::test]
    async fn disabled_client_always_errors() {
        let o = CompletionOptions::default();
        assert!(DisabledClient.complete("p", "m", &o).await.is_err());
        assert!(!DisabledClient.is_enabled());
    }

    #[test]
    fn default_config_builds_a_disabled_client() {
        let client = build_client_from_config(&AiConfig::default()).unwrap();
        assert!(!client.is_enabled());
        assert_eq!(client.provider_name(), "disabled");
        assert!(MockClient::offline().is_enabled());
    }
}
