// src/notify/mod.rs
pub mod discord;
pub mod slack;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::PublishConfig;
use crate::error::PublishError;
use crate::models::PublishCandidate;

pub use discord::DiscordSink;
pub use slack::SlackSink;

/// What gets posted for one published item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub title: String,
    pub link: String,
    pub summary: String,
    pub category: Option<String>,
    pub importance: u8,
    pub language: Option<String>,
}

impl OutboundMessage {
    pub fn from_candidate(c: &PublishCandidate) -> Self {
        let summary = c
            .analysis
            .summary
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| c.item.item.summary.clone());
        let title = if c.item.item.title.is_empty() {
            c.item.item.guid.clone().unwrap_or_default()
        } else {
            c.item.item.title.clone()
        };
        Self {
            title,
            link: c.item.item.link.clone(),
            summary,
            category: c.analysis.category.clone(),
            importance: c.analysis.importance.unwrap_or(0),
            language: c.analysis.language.clone(),
        }
    }

    /// Plain-text rendering shared by the text-only sinks.
    pub fn text(&self) -> String {
        let mut out = format!("*{}*", self.title);
        if let Some(cat) = &self.category {
            out.push_str(&format!(" [{cat}]"));
        }
        out.push_str(&format!(" ({}/20)", self.importance));
        if !self.summary.is_empty() {
            out.push('\n');
            out.push_str(&self.summary);
        }
        if !self.link.is_empty() {
            out.push('\n');
            out.push_str(&self.link);
        }
        out
    }
}

/// Message id recorded when a sink accepted a post (2xx) but returned no readable id.
pub const UNKNOWN_MESSAGE_ID: &str = "unknown";

/// Downstream messaging channel. Returns the sink's message id.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn publish(&self, target: &str, message: &OutboundMessage)
        -> Result<String, PublishError>;

    fn name(&self) -> &'static str;
}

/// Dry-run sink: logs the message and hands back a synthetic id.
#[derive(Default)]
pub struct LogSink {
    seq: AtomicU64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageSink for LogSink {
    async fn publish(
        &self,
        target: &str,
        message: &OutboundMessage,
    ) -> Result<String, PublishError> {
        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            target_channel = target,
            title = %message.title,
            link = %message.link,
            importance = message.importance,
            "publish (log sink)"
        );
        Ok(format!("log-{n}"))
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Sink selected by `[publish].sink`. Config is already validated.
pub fn build_sink(cfg: &PublishConfig) -> Result<Arc<dyn MessageSink>> {
    Ok(match cfg.sink.as_str() {
        "discord" => Arc::new(DiscordSink::new()),
        "slack" => Arc::new(SlackSink::new(cfg.token.clone())),
        _ => Arc::new(LogSink::new()),
    })
}
