// src/notify/slack.rs
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use super::{MessageSink, OutboundMessage, UNKNOWN_MESSAGE_ID};
use crate::error::PublishError;

const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";

/// Slack Web API sink. The target is a channel id; the message id is the `ts`.
pub struct SlackSink {
    token: String,
    api_url: String,
    client: Client,
    timeout: Duration,
}

impl SlackSink {
    pub fn new(token: String) -> Self {
        Self {
            token,
            api_url: POST_MESSAGE_URL.to_string(),
            client: Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Point at a different API endpoint (tests, proxies).
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    ok: bool,
    ts: Option<String>,
    error: Option<String>,
}

#[async_trait]
impl MessageSink for SlackSink {
    async fn publish(
        &self,
        target: &str,
        message: &OutboundMessage,
    ) -> Result<String, PublishError> {
        let body = serde_json::json!({
            "channel": target,
            "text": message.text(),
            "unfurl_links": false,
        });

        let rsp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::from_request("slack post", &e))?;

        let status = rsp.status();
        if !status.is_success() {
            return Err(PublishError::Transport(format!("slack non-2xx: {status}")));
        }
        let body = rsp.bytes().await.unwrap_or_default();
        let parsed: PostMessageResponse = match serde_json::from_slice(&body) {
            Ok(p) => p,
            Err(e) => {
                // Slack answers 2xx even for API errors, but an unreadable body may hide a post.
                warn!(%status, error = %e, "slack response unreadable, assuming posted");
                return Ok(UNKNOWN_MESSAGE_ID.to_string());
            }
        };

        match (parsed.ok, parsed.ts) {
            (true, Some(ts)) => Ok(ts),
            (true, None) => {
                warn!("slack accepted the post without a ts");
                Ok(UNKNOWN_MESSAGE_ID.to_string())
            }
            (false, _) => Err(PublishError::Rejected(
                parsed.error.unwrap_or_else(|| "unknown slack error".into()),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "slack"
    }
}
