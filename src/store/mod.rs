// src/store/mod.rs
//! Storage seam.
//!
//! Four logical tables: `feed_state` (by feed id), `items` (unique content
//! hash), `ai_analysis` / `dedup_decisions` (one row per item) and
//! `publications` (unique dedup group key). Every uniqueness guarantee the
//! pipeline relies on is enforced here, atomically, so concurrent runs never
//! race on a read-then-write.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::ingest::state::FeedState;
use crate::ingest::types::{FeedId, RawItem};
use crate::models::{
    AiAnalysis, AnalyzedItem, DedupDecision, ItemId, Publication, PublishCandidate, StoredItem,
    WindowEntry,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait Store: Send + Sync {
    // --- feed_state ---
    async fn load_feed_state(&self, feed_id: FeedId) -> Result<Option<FeedState>, StoreError>;
    async fn save_feed_state(&self, state: &FeedState) -> Result<(), StoreError>;
    async fn list_feed_states(&self) -> Result<Vec<FeedState>, StoreError>;

    // --- items ---
    /// Insert unless the content hash exists. Returns `(id, was_new)`.
    async fn insert_item(
        &self,
        item: &RawItem,
        now: DateTime<Utc>,
    ) -> Result<(ItemId, bool), StoreError>;
    async fn get_item(&self, id: ItemId) -> Result<Option<StoredItem>, StoreError>;
    async fn count_items(&self) -> Result<u64, StoreError>;
    /// Items that have no analysis row at all, oldest first.
    async fn items_without_analysis(&self, limit: usize) -> Result<Vec<StoredItem>, StoreError>;

    // --- ai_analysis ---
    /// Insert a `Pending` row. `false` when the item was already claimed.
    async fn claim_analysis(&self, item_id: ItemId, now: DateTime<Utc>)
        -> Result<bool, StoreError>;
    /// Overwrite a `Pending` row with its final state. `false` when the row is not pending.
    async fn complete_analysis(&self, analysis: &AiAnalysis) -> Result<bool, StoreError>;
    async fn get_analysis(&self, item_id: ItemId) -> Result<Option<AiAnalysis>, StoreError>;
    /// Successful analyses with no dedup decision yet: fewest failed dedup
    /// passes first, then analysis order.
    async fn analyzed_without_decision(
        &self,
        limit: usize,
    ) -> Result<Vec<AnalyzedItem>, StoreError>;
    /// Count one more dedup pass without a usable answer. Returns the new total.
    async fn record_dedup_failure(
        &self,
        item_id: ItemId,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    // --- dedup_decisions ---
    async fn insert_decision(&self, decision: &DedupDecision) -> Result<bool, StoreError>;
    async fn get_decision(&self, item_id: ItemId) -> Result<Option<DedupDecision>, StoreError>;
    /// Decided items since `since`, newest first, excluding `exclude` and withheld rows.
    async fn recent_window(
        &self,
        since: DateTime<Utc>,
        exclude: ItemId,
        limit: usize,
    ) -> Result<Vec<WindowEntry>, StoreError>;
    /// Publishable decisions since `since` whose group has no publication row.
    async fn pending_publications(
        &self,
        since: DateTime<Utc>,
        min_importance: u8,
        limit: usize,
    ) -> Result<Vec<PublishCandidate>, StoreError>;

    // --- publications ---
    /// Unique insert on the group key. `false` on conflict.
    async fn insert_publication(&self, publication: &Publication) -> Result<bool, StoreError>;
    async fn mark_published(
        &self,
        group_key: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    /// Remove a reservation that was never published.
    async fn delete_reservation(&self, group_key: &str) -> Result<bool, StoreError>;
    async fn get_publication(&self, group_key: &str) -> Result<Option<Publication>, StoreError>;
    /// Drop publications whose last activity is before `before`.
    async fn prune_publications(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}
