// src/store/memory.rs
//! In-process store for tests and `store.backend = "memory"`.
//! One lock guards every table, so each operation is atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::Store;
use crate::error::StoreError;
use crate::ingest::state::FeedState;
use crate::ingest::types::{FeedId, RawItem};
use crate::models::{
    AiAnalysis, AnalysisStatus, AnalyzedItem, DedupDecision, ItemId, Publication,
    PublishCandidate, StoredItem, WindowEntry,
};

#[derive(Default)]
struct Tables {
    feed_states: BTreeMap<FeedId, FeedState>,
    items: BTreeMap<ItemId, StoredItem>,
    by_hash: HashMap<String, ItemId>,
    next_item_id: ItemId,
    analyses: BTreeMap<ItemId, AiAnalysis>,
    decisions: BTreeMap<ItemId, DedupDecision>,
    dedup_failures: BTreeMap<ItemId, u32>,
    publications: BTreeMap<String, Publication>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Other("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_feed_state(&self, feed_id: FeedId) -> Result<Option<FeedState>, StoreError> {
        Ok(self.lock()?.feed_states.get(&feed_id).cloned())
    }

    async fn save_feed_state(&self, state: &FeedState) -> Result<(), StoreError> {
        self.lock()?
            .feed_states
            .insert(state.feed_id, state.clone());
        Ok(())
    }

    async fn list_feed_states(&self) -> Result<Vec<FeedState>, StoreError> {
        Ok(self.lock()?.feed_states.values().cloned().collect())
    }

    async fn insert_item(
        &self,
        item: &RawItem,
        now: DateTime<Utc>,
    ) -> Result<(ItemId, bool), StoreError> {
        let mut t = self.lock()?;
        if let Some(id) = t.by_hash.get(&item.content_hash) {
            return Ok((*id, false));
        }
        t.next_item_id += 1;
        let id = t.next_item_id;
        t.by_hash.insert(item.content_hash.clone(), id);
        t.items.insert(
            id,
            StoredItem {
                id,
                item: item.clone(),
                created_at: now,
            },
        );
        Ok((id, true))
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<StoredItem>, StoreError> {
        Ok(self.lock()?.items.get(&id).cloned())
    }

    async fn count_items(&self) -> Result<u64, StoreError> {
        Ok(self.lock()?.items.len() as u64)
    }

    async fn items_without_analysis(&self, limit: usize) -> Result<Vec<StoredItem>, StoreError> {
        let t = self.lock()?;
        Ok(t.items
            .values()
            .filter(|it| !t.analyses.contains_key(&it.id))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim_analysis(
        &self,
        item_id: ItemId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut t = self.lock()?;
        if !t.items.contains_key(&item_id) {
            return Err(StoreError::Other(format!("unknown item {item_id}")));
        }
        if t.analyses.contains_key(&item_id) {
            return Ok(false);
        }
        t.analyses.insert(item_id, AiAnalysis::pending(item_id, now));
        Ok(true)
    }

    async fn complete_analysis(&self, analysis: &AiAnalysis) -> Result<bool, StoreError> {
        let mut t = self.lock()?;
        match t.analyses.get_mut(&analysis.item_id) {
            Some(row) if row.status == AnalysisStatus::Pending => {
                *row = analysis.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_analysis(&self, item_id: ItemId) -> Result<Option<AiAnalysis>, StoreError> {
        Ok(self.lock()?.analyses.get(&item_id).cloned())
    }

    async fn analyzed_without_decision(
        &self,
        limit: usize,
    ) -> Result<Vec<AnalyzedItem>, StoreError> {
        let t = self.lock()?;
        let mut ready: Vec<&AiAnalysis> = t
            .analyses
            .values()
            .filter(|a| a.status == AnalysisStatus::Success)
            .filter(|a| !t.decisions.contains_key(&a.item_id))
            .collect();
        ready.sort_by_key(|a| {
            let failures = t.dedup_failures.get(&a.item_id).copied().unwrap_or(0);
            (failures, a.updated_at, a.item_id)
        });
        Ok(ready
            .into_iter()
            .take(limit)
            .filter_map(|a| {
                t.items.get(&a.item_id).map(|item| AnalyzedItem {
                    item: item.clone(),
                    analysis: a.clone(),
                })
            })
            .collect())
    }

    async fn record_dedup_failure(
        &self,
        item_id: ItemId,
        _now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut t = self.lock()?;
        let n = t.dedup_failures.entry(item_id).or_insert(0);
        *n += 1;
        Ok(*n)
    }

    async fn insert_decision(&self, decision: &DedupDecision) -> Result<bool, StoreError> {
        let mut t = self.lock()?;
        if t.decisions.contains_key(&decision.item_id) {
            return Ok(false);
        }
        t.decisions.insert(decision.item_id, decision.clone());
        Ok(true)
    }

    async fn get_decision(&self, item_id: ItemId) -> Result<Option<DedupDecision>, StoreError> {
        Ok(self.lock()?.decisions.get(&item_id).cloned())
    }

    async fn recent_window(
        &self,
        since: DateTime<Utc>,
        exclude: ItemId,
        limit: usize,
    ) -> Result<Vec<WindowEntry>, StoreError> {
        let t = self.lock()?;
        let mut recent: Vec<&DedupDecision> = t
            .decisions
            .values()
            .filter(|d| d.item_id != exclude && d.decided_at >= since && !d.is_withheld())
            .collect();
        recent.sort_by(|a, b| {
            b.decided_at
                .cmp(&a.decided_at)
                .then(b.item_id.cmp(&a.item_id))
        });
        Ok(recent
            .into_iter()
            .filter_map(|d| {
                let stored = t.items.get(&d.item_id)?;
                let analysis = t.analyses.get(&d.item_id);
                Some(window_entry(stored, analysis, d))
            })
            .take(limit)
            .collect())
    }

    async fn pending_publications(
        &self,
        since: DateTime<Utc>,
        min_importance: u8,
        limit: usize,
    ) -> Result<Vec<PublishCandidate>, StoreError> {
        let t = self.lock()?;
        let mut ready: Vec<&DedupDecision> = t
            .decisions
            .values()
            .filter(|d| d.can_be_publish && d.decided_at >= since)
            .filter(|d| !t.publications.contains_key(&d.group_key))
            .collect();
        ready.sort_by_key(|d| (d.decided_at, d.item_id));
        Ok(ready
            .into_iter()
            .filter_map(|d| {
                let item = t.items.get(&d.item_id)?;
                let analysis = t.analyses.get(&d.item_id)?;
                let importance = analysis.importance.unwrap_or(0);
                (analysis.status == AnalysisStatus::Success && importance >= min_importance)
                    .then(|| PublishCandidate {
                        item: item.clone(),
                        analysis: analysis.clone(),
                        decision: d.clone(),
                    })
            })
            .take(limit)
            .collect())
    }

    async fn insert_publication(&self, publication: &Publication) -> Result<bool, StoreError> {
        let mut t = self.lock()?;
        if t.publications.contains_key(&publication.group_key) {
            return Ok(false);
        }
        t.publications
            .insert(publication.group_key.clone(), publication.clone());
        Ok(true)
    }

    async fn mark_published(
        &self,
        group_key: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut t = self.lock()?;
        match t.publications.get_mut(group_key) {
            Some(p) => {
                p.published_at = Some(at);
                p.message_id = Some(message_id.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_reservation(&self, group_key: &str) -> Result<bool, StoreError> {
        let mut t = self.lock()?;
        let unpublished = t
            .publications
            .get(group_key)
            .is_some_and(|p| p.published_at.is_none());
        if unpublished {
            t.publications.remove(group_key);
        }
        Ok(unpublished)
    }

    async fn get_publication(&self, group_key: &str) -> Result<Option<Publication>, StoreError> {
        Ok(self.lock()?.publications.get(group_key).cloned())
    }

    async fn prune_publications(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut t = self.lock()?;
        let n = t.publications.len();
        t.publications
            .retain(|_, p| p.published_at.unwrap_or(p.reserved_at) >= before);
        Ok((n - t.publications.len()) as u64)
    }
}

/// Window row: analysis summary when present, feed summary otherwise.
pub(crate) fn window_entry(
    stored: &StoredItem,
    analysis: Option<&AiAnalysis>,
    decision: &DedupDecision,
) -> WindowEntry {
    let summary = analysis
        .and_then(|a| a.summary.clone())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| stored.item.summary.clone());
    WindowEntry {
        item_id: stored.id,
        title: stored.item.title.clone(),
        link: stored.item.link.clone(),
        summary,
        category: analysis.and_then(|a| a.category.clone()),
        group_key: decision.group_key.clone(),
        decided_at: decision.decided_at,
    }
}
