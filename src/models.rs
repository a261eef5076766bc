// src/models.rs
//! Rows that flow between the repositories, the AI services and the publish gate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ingest::types::RawItem;

pub type ItemId = i64;

/// A raw item after the exact-match tier accepted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    pub id: ItemId,
    pub item: RawItem,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStatus {
    Pending,
    Success,
    Failed,
}

impl AnalysisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::Success => "success",
            AnalysisStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AnalysisStatus::Pending),
            "success" => Some(AnalysisStatus::Success),
            "failed" => Some(AnalysisStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AnalysisStatus::Pending)
    }
}

/// One row per item. `Pending` is the claim; `Success`/`Failed` are final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiAnalysis {
    pub item_id: ItemId,
    pub status: AnalysisStatus,
    pub language: Option<String>,
    /// 1..=20
    pub importance: Option<u8>,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub model: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AiAnalysis {
    pub fn pending(item_id: ItemId, now: DateTime<Utc>) -> Self {
        Self {
            item_id,
            status: AnalysisStatus::Pending,
            language: None,
            importance: None,
            category: None,
            summary: None,
            model: None,
            attempts: 0,
            error: None,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedItem {
    pub item: StoredItem,
    pub analysis: AiAnalysis,
}

/// Result of the semantic tier for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupDecision {
    pub item_id: ItemId,
    /// Window items the candidate was compared against.
    pub compared_with: Vec<ItemId>,
    pub matched_item: Option<ItemId>,
    /// 0..=100
    pub similarity: u8,
    pub can_be_publish: bool,
    pub group_key: String,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}

impl DedupDecision {
    /// Terminal decision for an item the AI could not compare: never published,
    /// never used as a comparison target.
    pub fn withheld(
        item_id: ItemId,
        content_hash: &str,
        compared_with: Vec<ItemId>,
        reason: String,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id,
            compared_with,
            matched_item: None,
            similarity: 0,
            can_be_publish: false,
            group_key: hash_group_key(content_hash),
            reason,
            decided_at: at,
        }
    }

    /// Duplicates always name the item they matched; only a withheld row has neither.
    pub fn is_withheld(&self) -> bool {
        !self.can_be_publish && self.matched_item.is_none()
    }
}

/// A prior item the candidate may duplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub item_id: ItemId,
    pub title: String,
    pub link: String,
    pub summary: String,
    pub category: Option<String>,
    pub group_key: String,
    pub decided_at: DateTime<Utc>,
}

/// Publish record; `published_at == None` means reserved but not yet sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub group_key: String,
    pub item_id: ItemId,
    pub reserved_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
}

/// An item cleared by both dedup tiers and not yet published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishCandidate {
    pub item: StoredItem,
    pub analysis: AiAnalysis,
    pub decision: DedupDecision,
}

/// Group key for an item that starts its own dedup group.
pub fn hash_group_key(content_hash: &str) -> String {
    format!("hash:{content_hash}")
}
