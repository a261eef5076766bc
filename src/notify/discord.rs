// src/notify/discord.rs
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use super::{MessageSink, OutboundMessage, UNKNOWN_MESSAGE_ID};
use crate::error::PublishError;

/// Discord webhook sink. The target is the webhook url.
#[derive(Clone)]
pub struct DiscordSink {
    client: Client,
    timeout: Duration,
    max_retries: u8,
}

impl Default for DiscordSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscordSink {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }
}

#[async_trait]
impl MessageSink for DiscordSink {
    async fn publish(
        &self,
        target: &str,
        message: &OutboundMessage,
    ) -> Result<String, PublishError> {
        let payload = DiscordWebhookPayload::embed(message);
        // wait=true makes Discord return the created message.
        let url = if target.contains('?') {
            format!("{target}&wait=true")
        } else {
            format!("{target}?wait=true")
        };

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&url)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            let rsp = match res {
                Ok(rsp) => rsp,
                // Only a connection that never opened is safe to resend.
                Err(e) if e.is_connect() && attempt < self.max_retries => {
                    tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
                    continue;
                }
                Err(e) => return Err(PublishError::from_request("Discord webhook", &e)),
            };

            let status = rsp.status();
            if status.is_client_error() && status.as_u16() != 429 {
                return Err(PublishError::Rejected(format!("Discord webhook HTTP {status}")));
            }
            if !status.is_success() {
                if attempt < self.max_retries {
                    tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
                    continue;
                }
                return Err(PublishError::Transport(format!("Discord webhook HTTP {status}")));
            }

            // 2xx: the message is posted whether or not the body names it.
            let body = rsp.bytes().await.unwrap_or_default();
            return Ok(match serde_json::from_slice::<DiscordMessage>(&body) {
                Ok(created) => created.id,
                Err(e) => {
                    warn!(%status, error = %e, "Discord accepted the post without a message id");
                    UNKNOWN_MESSAGE_ID.to_string()
                }
            });
        }
    }

    fn name(&self) -> &'static str {
        "discord"
    }
}

#[derive(Debug, Serialize)]
struct DiscordEmbed {
    title: String,
    url: Option<String>,
    description: String,
}

#[derive(Debug, Serialize)]
struct DiscordWebhookPayload {
    content: Option<String>,
    embeds: Vec<DiscordEmbed>,
}

impl DiscordWebhookPayload {
    fn embed(m: &OutboundMessage) -> Self {
        let category = m.category.as_deref().unwrap_or("uncategorized");
        let description = format!(
            "{}\n\n**Category:** {}\n**Importance:** {}/20",
            m.summary, category, m.importance
        );
        Self {
            content: None,
            embeds: vec![DiscordEmbed {
                // Discord caps embed titles at 256 chars.
                title: m.title.chars().take(256).collect(),
                url: (!m.link.is_empty()).then(|| m.link.clone()),
                description,
            }],
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
}
