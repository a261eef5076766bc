// src/error.rs
//! Error taxonomy shared by the fetch, storage, analysis and publish layers.
//!
//! Only [`ConfigError`] is fatal (at load time). Everything else is recorded
//! against the feed or item it belongs to and the batch carries on.

use thiserror::Error;

use crate::ingest::types::FeedId;

/// Rejected configuration. Raised while loading, before any feed is polled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("feed {id}: invalid url {url:?}: {reason}")]
    InvalidUrl {
        id: FeedId,
        url: String,
        reason: String,
    },

    #[error("feed {id}: unsupported url scheme {scheme:?} (expected http or https)")]
    UnsupportedScheme { id: FeedId, scheme: String },

    #[error("feed id must be a positive integer, got {0}")]
    InvalidId(FeedId),

    #[error("feed {id}: timeout must be greater than zero")]
    ZeroTimeout { id: FeedId },

    #[error("feed {id}: invalid header {name:?}: {reason}")]
    InvalidHeader {
        id: FeedId,
        name: String,
        reason: String,
    },

    #[error("feed {id}: invalid proxy url {proxy:?}: {reason}")]
    InvalidProxy {
        id: FeedId,
        proxy: String,
        reason: String,
    },

    #[error("duplicate feed id {0}")]
    DuplicateFeedId(FeedId),

    #[error("{field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },
}

/// Failure class for one feed fetch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server error: HTTP {0}")]
    Server(u16),

    #[error("client error: HTTP {0}")]
    Client(u16),

    #[error("unexpected HTTP status {0}")]
    Unexpected(u16),

    #[error("parse error: {0}")]
    Parse(String),
}

impl FetchError {
    /// Short label used in logs, metrics and run reports.
    pub fn class(&self) -> &'static str {
        match self {
            FetchError::Network(_) => "network",
            FetchError::Server(_) => "server",
            FetchError::Client(_) => "client",
            FetchError::Unexpected(_) => "unexpected",
            FetchError::Parse(_) => "parse",
        }
    }
}

/// The AI answered, but not with something we can use.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AiParseError {
    #[error("no JSON object found in response")]
    NoJson,

    #[error("malformed JSON: {0}")]
    Malformed(String),

    #[error("field {field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },

    #[error("field {0} is missing or empty")]
    Missing(&'static str),

    #[error("AI call failed: {0}")]
    Api(String),

    #[error("AI call timed out after {0}s")]
    Timeout(u64),
}

/// Persistence failure. One item's save error never stops the rest of a batch.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Other(String),
}

/// The messaging sink refused or could not be reached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("sink transport error: {0}")]
    Transport(String),

    #[error("sink rejected message: {0}")]
    Rejected(String),

    /// The request may have reached the sink; delivery is unknown.
    #[error("sink delivery unconfirmed: {0}")]
    Unconfirmed(String),
}

impl PublishError {
    /// `false` only when the sink certainly did not post the message.
    pub fn may_have_been_delivered(&self) -> bool {
        matches!(self, PublishError::Unconfirmed(_))
    }

    /// Classify a failed request: only a connection that was never made is a clean failure.
    pub fn from_request(sink: &str, e: &reqwest::Error) -> Self {
        if e.is_connect() || e.is_builder() {
            PublishError::Transport(format!("{sink} request failed: {e}"))
        } else {
            PublishError::Unconfirmed(format!("{sink} request failed: {e}"))
        }
    }
}
