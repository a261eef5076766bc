// src/repo/publications.rs
//! At-most-once publish gate.
//!
//! Reserve the dedup group (unique insert), call the sink, then record the
//! message id. A send that certainly failed releases the reservation so a later
//! run may retry; a send whose delivery is unknown keeps it.
//! Losing the reservation race is a normal skip, not an error.

use chrono::Duration;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::models::{ItemId, Publication, PublishCandidate};
use crate::notify::{MessageSink, OutboundMessage};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishSkip {
    /// Semantic duplicate of an earlier item.
    Duplicate { matched_item: Option<ItemId>, similarity: u8 },
    /// Scored below `min_importance`.
    LowValue { importance: u8 },
    /// Another run (or an earlier item) already holds the group.
    AlreadyReserved,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { group_key: String, message_id: String },
    Skipped { group_key: String, reason: PublishSkip },
    Failed { group_key: String, error: String },
}

impl PublishOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            PublishOutcome::Published { .. } => "published",
            PublishOutcome::Skipped { .. } => "skipped",
            PublishOutcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Clone)]
pub struct PublicationRepository {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl PublicationRepository {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Atomically claim the group. `false` when it is already claimed.
    pub async fn try_reserve(&self, group_key: &str, item_id: ItemId) -> Result<bool, StoreError> {
        let p = Publication {
            group_key: group_key.to_string(),
            item_id,
            reserved_at: self.clock.now(),
            published_at: None,
            message_id: None,
        };
        self.store.insert_publication(&p).await
    }

    pub async fn record_published(
        &self,
        group_key: &str,
        message_id: &str,
    ) -> Result<(), StoreError> {
        let found = self
            .store
            .mark_published(group_key, message_id, self.clock.now())
            .await?;
        if !found {
            return Err(StoreError::Other(format!(
                "no reservation for group {group_key}"
            )));
        }
        Ok(())
    }

    /// Drop an unpublished reservation. Published rows are never released.
    pub async fn release(&self, group_key: &str) -> Result<bool, StoreError> {
        self.store.delete_reservation(group_key).await
    }

    pub async fn get(&self, group_key: &str) -> Result<Option<Publication>, StoreError> {
        self.store.get_publication(group_key).await
    }

    /// Forget publications older than `older_than` so their groups may publish again.
    pub async fn prune(&self, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = self.clock.now() - older_than;
        let n = self.store.prune_publications(cutoff).await?;
        info!(removed = n, cutoff = %cutoff, "pruned publications");
        Ok(n)
    }

    /// Full gate for one candidate: filters, reserve, send, record or release.
    pub async fn publish_gated(
        &self,
        candidate: &PublishCandidate,
        sink: &dyn MessageSink,
        target: &str,
        min_importance: u8,
    ) -> PublishOutcome {
        let d = &candidate.decision;
        let group_key = d.group_key.clone();

        if !d.can_be_publish {
            return skip(
                group_key,
                PublishSkip::Duplicate {
                    matched_item: d.matched_item,
                    similarity: d.similarity,
                },
            );
        }
        let importance = candidate.analysis.importance.unwrap_or(0);
        if importance < min_importance {
            debug!(item_id = d.item_id, importance, min_importance, "low value, not published");
            return skip(group_key, PublishSkip::LowValue { importance });
        }

        match self.try_reserve(&group_key, d.item_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(item_id = d.item_id, group_key = %group_key, "group already reserved");
                return skip(group_key, PublishSkip::AlreadyReserved);
            }
            Err(e) => {
                warn!(item_id = d.item_id, error = %e, "reservation failed");
                return fail(group_key, e.to_string());
            }
        }

        let message = OutboundMessage::from_candidate(candidate);
        match sink.publish(target, &message).await {
            Ok(message_id) => {
                if let Err(e) = self.record_published(&group_key, &message_id).await {
                    // The send happened; the reservation row still blocks replays.
                    warn!(item_id = d.item_id, error = %e, "published but not recorded");
                }
                info!(
                    item_id = d.item_id,
                    group_key = %group_key,
                    sink = sink.name(),
                    message_id = %message_id,
                    "published"
                );
                counter!("feedgate_published_total", "sink" => sink.name()).increment(1);
                PublishOutcome::Published {
                    group_key,
                    message_id,
                }
            }
            Err(e) if e.may_have_been_delivered() => {
                // Keep the reservation: a resend could post the group twice.
                warn!(item_id = d.item_id, sink = sink.name(), error = %e, "publish unconfirmed, group stays reserved");
                counter!("feedgate_publish_failed_total", "sink" => sink.name()).increment(1);
                fail(group_key, e.to_string())
            }
            Err(e) => {
                warn!(item_id = d.item_id, sink = sink.name(), error = %e, "publish failed, releasing");
                if let Err(re) = self.release(&group_key).await {
                    warn!(group_key = %group_key, error = %re, "release failed");
                }
                counter!("feedgate_publish_failed_total", "sink" => sink.name()).increment(1);
                fail(group_key, e.to_string())
            }
        }
    }
}

fn skip(group_key: String, reason: PublishSkip) -> PublishOutcome {
    counter!("feedgate_publish_skipped_total").increment(1);
    PublishOutcome::Skipped { group_key, reason }
}

fn fail(group_key: String, error: String) -> PublishOutcome {
    PublishOutcome::Failed { group_key, error }
}
