// src/repo/items.rs
//! Exact-match dedup tier: one row per content hash.

use metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::ingest::types::RawItem;
use crate::models::{ItemId, StoredItem};
use crate::store::Store;

/// Outcome of storing one fetch batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreBatch {
    /// `(id, was_new)` for every item that was saved or already present.
    pub stored: Vec<(ItemId, bool)>,
    pub new: usize,
    pub existing: usize,
    /// `(content_hash, error)` for items whose save failed.
    pub failures: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct ItemRepository {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl ItemRepository {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Idempotent: a known content hash returns the existing id with `false`.
    pub async fn store(&self, item: &RawItem) -> Result<(ItemId, bool), StoreError> {
        let (id, was_new) = self.store.insert_item(item, self.clock.now()).await?;
        if was_new {
            counter!("feedgate_items_new_total").increment(1);
        } else {
            debug!(item_id = id, hash = %item.content_hash, "exact duplicate");
            counter!("feedgate_items_duplicate_total").increment(1);
        }
        Ok((id, was_new))
    }

    /// Store every item; a failed save is recorded and the rest still go through.
    pub async fn store_all(&self, items: &[RawItem]) -> StoreBatch {
        let mut batch = StoreBatch::default();
        for item in items {
            match self.store(item).await {
                Ok((id, was_new)) => {
                    batch.stored.push((id, was_new));
                    if was_new {
                        batch.new += 1;
                    } else {
                        batch.existing += 1;
                    }
                }
                Err(e) => {
                    warn!(feed_id = item.feed_id, hash = %item.content_hash, error = %e, "item save failed");
                    counter!("feedgate_items_save_failed_total").increment(1);
                    batch.failures.push((item.content_hash.clone(), e.to_string()));
                }
            }
        }
        batch
    }

    pub async fn get(&self, id: ItemId) -> Result<Option<StoredItem>, StoreError> {
        self.store.get_item(id).await
    }

    /// Items that summarization has not claimed yet.
    pub async fn unprocessed(&self, limit: usize) -> Result<Vec<StoredItem>, StoreError> {
        self.store.items_without_analysis(limit).await
    }
}
