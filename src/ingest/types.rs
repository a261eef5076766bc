// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::ingest::{content_hash, normalize_text};

pub type FeedId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enclosure {
    pub url: String,
    pub mime: Option<String>,
    pub length: Option<u64>,
}

/// One entry exactly as the feed parser produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEntry {
    pub title: Option<String>,
    pub link: Option<String>,
    pub guid: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    pub authors: Vec<String>,
    pub categories: Vec<String>,
    pub enclosure: Option<Enclosure>,
    pub published_at: Option<DateTime<Utc>>,
}

/// A validated entry, ready for exact-match deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub feed_id: FeedId,
    pub title: String,
    pub link: String,
    pub guid: Option<String>,
    pub summary: String,
    pub content: Option<String>,
    pub authors: Vec<String>,
    pub categories: BTreeSet<String>,
    pub enclosure: Option<Enclosure>,
    pub published_at: Option<DateTime<Utc>>,
    pub content_hash: String,
}

impl RawItem {
    /// Returns `None` unless the entry has a title and a link, or a guid.
    pub fn from_entry(feed_id: FeedId, entry: RawEntry) -> Option<Self> {
        let title = entry.title.map(|t| normalize_text(&t)).unwrap_or_default();
        let link = entry.link.map(|l| l.trim().to_string()).unwrap_or_default();
        let guid = entry
            .guid
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty());

        let has_identity = (!title.is_empty() && !link.is_empty()) || guid.is_some();
        if !has_identity {
            return None;
        }

        let summary = entry
            .summary
            .as_deref()
            .or(entry.content.as_deref())
            .map(normalize_text)
            .unwrap_or_default();

        let categories = entry
            .categories
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        let authors = entry
            .authors
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();

        let content_hash = content_hash(&title, &link, guid.as_deref());

        Some(Self {
            feed_id,
            title,
            link,
            guid,
            summary,
            content: entry.content,
            authors,
            categories,
            enclosure: entry.enclosure,
            published_at: entry.published_at,
            content_hash,
        })
    }
}
