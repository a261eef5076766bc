// src/pipeline.rs
//! One full pass: fetch, exact dedup, summarize, semantic dedup, gated publish.
//!
//! Item- and feed-level problems end up in the [`RunReport`]; only a store
//! that cannot be queried at all aborts a stage.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::analyze::ai_adapter::DynAiClient;
use crate::analyze::dedup::{DedupOutcome, DeduplicationService};
use crate::analyze::summarize::SummarizationService;
use crate::clock::Clock;
use crate::config::{AppConfig, FeedConfig};
use crate::ingest::parser::FeedParser;
use crate::ingest::runner::{FetchOutcome, FetchRun, FetchRunner, SkipReason};
use crate::ingest::state::Health;
use crate::ingest::transport::HttpTransport;
use crate::ingest::types::FeedId;
use crate::models::{AnalysisStatus, ItemId};
use crate::notify::MessageSink;
use crate::repo::{ItemRepository, PublicationRepository, PublishOutcome, PublishSkip};
use crate::store::Store;

/// Everything the pipeline talks to, injected by the caller.
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub transport: Arc<dyn HttpTransport>,
    pub parser: Arc<dyn FeedParser>,
    pub ai: DynAiClient,
    pub sink: Arc<dyn MessageSink>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FeedReport {
    pub feed_id: FeedId,
    pub outcome: String,
    pub status: Option<u16>,
    pub items: usize,
    pub invalid: usize,
    pub error: Option<String>,
    pub error_count: u32,
    pub backoff_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ItemReport {
    pub item_id: ItemId,
    /// "summarize" | "dedup" | "publish"
    pub stage: &'static str,
    pub outcome: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RunCounters {
    pub feeds_attempted: usize,
    pub feeds_ok: usize,
    pub feeds_not_modified: usize,
    pub feeds_failed: usize,
    pub feeds_skipped: usize,
    pub parse_errors: usize,
    pub items_parsed: usize,
    pub items_new: usize,
    pub items_existing: usize,
    pub analyzed: usize,
    pub analysis_failed: usize,
    pub decided: usize,
    pub duplicates: usize,
    pub dedup_failed: usize,
    pub published: usize,
    pub publish_skipped: usize,
    pub publish_failed: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feeds: Vec<FeedReport>,
    pub items: Vec<ItemReport>,
    pub counters: RunCounters,
    pub warnings: Vec<String>,
}

/// Persisted view of one configured feed (for `feedgate feeds`).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FeedStatus {
    pub feed_id: FeedId,
    pub url: String,
    pub enabled: bool,
    pub health: Health,
    pub error_count: u32,
    pub last_status: u16,
    pub fetched_at: Option<DateTime<Utc>>,
    pub backoff_remaining_secs: i64,
}

pub struct Pipeline {
    fetcher: FetchRunner,
    items: ItemRepository,
    summarizer: SummarizationService,
    dedup: DeduplicationService,
    publications: PublicationRepository,
    sink: Arc<dyn MessageSink>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    ai_enabled: bool,
    target: String,
    min_importance: u8,
    summarize_limit: usize,
    dedup_limit: usize,
    publish_limit: usize,
    retention: Duration,
}

impl Pipeline {
    pub fn new(c: Collaborators, cfg: &AppConfig) -> Result<Self> {
        let fetcher = FetchRunner::new(
            c.transport,
            c.parser,
            c.store.clone(),
            c.clock.clone(),
            cfg.backoff,
        )
        .with_concurrency(cfg.runner.concurrency);

        let mut summarizer =
            SummarizationService::new(c.ai.clone(), c.store.clone(), c.clock.clone(), &cfg.ai.model)
                .configured(&cfg.ai, &cfg.summarize);
        if let Some(t) = cfg.prompt_template()? {
            summarizer = summarizer.with_template(t);
        }

        let ai_enabled = c.ai.is_enabled();
        let dedup = DeduplicationService::new(c.ai, c.store.clone(), c.clock.clone(), &cfg.ai.model)
            .configured(&cfg.ai, &cfg.dedup);

        Ok(Self {
            fetcher,
            items: ItemRepository::new(c.store.clone(), c.clock.clone()),
            summarizer,
            dedup,
            publications: PublicationRepository::new(c.store.clone(), c.clock.clone()),
            sink: c.sink,
            store: c.store,
            clock: c.clock,
            ai_enabled,
            target: cfg.publish.target.clone(),
            min_importance: cfg.publish.min_importance,
            summarize_limit: cfg.summarize.batch_limit.max(1),
            dedup_limit: cfg.dedup.batch_limit.max(1),
            publish_limit: cfg.publish.batch_limit.max(1),
            retention: Duration::days(cfg.publish.retention_days.min(36_500) as i64),
        })
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn publications(&self) -> &PublicationRepository {
        &self.publications
    }

    /// Fetch every feed regardless of its polling interval.
    pub async fn run_once(&self, feeds: &[FeedConfig]) -> RunReport {
        let started_at = self.clock.now();
        let fetched = self.fetcher.run_for_all_feeds(feeds).await;
        self.finish(started_at, fetched).await
    }

    /// Like [`run_once`](Self::run_once) but feeds polled within their interval are skipped.
    pub async fn run_due(&self, feeds: &[FeedConfig]) -> RunReport {
        let started_at = self.clock.now();
        let fetched = self.fetcher.run_due_feeds(feeds).await;
        self.finish(started_at, fetched).await
    }

    async fn finish(&self, started_at: DateTime<Utc>, fetched: FetchRun) -> RunReport {
        let mut report = RunReport {
            started_at,
            finished_at: started_at,
            feeds: Vec::new(),
            items: Vec::new(),
            counters: RunCounters::default(),
            warnings: Vec::new(),
        };

        self.collect_fetch(&fetched, &mut report);
        self.store_items(&fetched, &mut report).await;
        if self.ai_enabled {
            self.summarize(&mut report).await;
            self.deduplicate(&mut report).await;
        } else {
            report
                .warnings
                .push("AI provider disabled: new items wait for analysis".to_string());
        }
        self.publish(&mut report).await;

        report.finished_at = self.clock.now();
        counter!("feedgate_runs_total").increment(1);
        let c = &report.counters;
        info!(
            feeds_ok = c.feeds_ok,
            feeds_failed = c.feeds_failed,
            items_new = c.items_new,
            analyzed = c.analyzed,
            duplicates = c.duplicates,
            published = c.published,
            warnings = report.warnings.len(),
            "run complete"
        );
        report
    }

    fn collect_fetch(&self, fetched: &FetchRun, report: &mut RunReport) {
        let m = &fetched.metrics;
        report.counters.feeds_attempted = m.attempts;
        report.counters.feeds_ok = m.ok;
        report.counters.feeds_not_modified = m.not_modified;
        report.counters.feeds_failed = m.errors;
        report.counters.parse_errors = m.parse_errors;
        report.counters.feeds_skipped = m.skipped;
        report.counters.items_parsed = m.items_parsed;

        for r in fetched.results.values() {
            let (items, invalid, error) = match &r.outcome {
                FetchOutcome::Fetched { items, invalid } => (items.len(), *invalid, None),
                FetchOutcome::Failed(e) => (0, 0, Some(e.to_string())),
                FetchOutcome::Skipped(SkipReason::StateUnavailable(e)) => (0, 0, Some(e.clone())),
                _ => (0, 0, None),
            };
            let outcome = match &r.outcome {
                FetchOutcome::Skipped(SkipReason::Disabled) => "skipped:disabled".to_string(),
                FetchOutcome::Skipped(SkipReason::Backoff { .. }) => "skipped:backoff".to_string(),
                FetchOutcome::Skipped(SkipReason::NotDue) => "skipped:not_due".to_string(),
                FetchOutcome::Skipped(SkipReason::StateUnavailable(_)) => {
                    "skipped:state_unavailable".to_string()
                }
                other => other.label().to_string(),
            };
            if let Some(e) = &r.persist_error {
                report
                    .warnings
                    .push(format!("feed {}: state not saved: {e}", r.feed_id));
            }
            report.feeds.push(FeedReport {
                feed_id: r.feed_id,
                outcome,
                status: r.status,
                items,
                invalid,
                error,
                error_count: r.state.error_count,
                backoff_until: r.state.backoff_until,
            });
        }
    }

    async fn store_items(&self, fetched: &FetchRun, report: &mut RunReport) {
        for r in fetched.results.values() {
            let batch = self.items.store_all(r.items()).await;
            report.counters.items_new += batch.new;
            report.counters.items_existing += batch.existing;
            for (hash, e) in batch.failures {
                report
                    .warnings
                    .push(format!("feed {}: item {hash} not saved: {e}", r.feed_id));
            }
        }
    }

    async fn summarize(&self, report: &mut RunReport) {
        let res = match self.summarizer.run_pending(self.summarize_limit).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "could not list unprocessed items");
                report.warnings.push(format!("summarize: {e}"));
                return;
            }
        };
        report.counters.analyzed += res.succeeded;
        report.counters.analysis_failed += res.failed;
        for a in &res.analyses {
            let outcome = a.status.as_str().to_string();
            let detail = match a.status {
                AnalysisStatus::Failed => a.error.clone(),
                _ => a.importance.map(|i| format!("importance {i}")),
            };
            report.items.push(ItemReport {
                item_id: a.item_id,
                stage: "summarize",
                outcome,
                detail,
            });
        }
        for (id, e) in res.store_errors {
            report
                .warnings
                .push(format!("item {id}: analysis not saved: {e}"));
        }
    }

    async fn deduplicate(&self, report: &mut RunReport) {
        let outcomes = match self.dedup.run_pending(self.dedup_limit).await {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "could not list analyzed items");
                report.warnings.push(format!("dedup: {e}"));
                return;
            }
        };

        for (candidate, outcome) in outcomes {
            let (outcome, detail) = match outcome {
                DedupOutcome::Decided(d) => {
                    report.counters.decided += 1;
                    let importance = candidate.analysis.importance.unwrap_or(0);
                    if !d.can_be_publish {
                        report.counters.duplicates += 1;
                        ("duplicate", Some(format!("similarity {} -> {}", d.similarity, d.group_key)))
                    } else if importance < self.min_importance {
                        ("low_value", Some(format!("importance {importance}")))
                    } else {
                        ("unique", Some(format!("similarity {}", d.similarity)))
                    }
                }
                DedupOutcome::Withheld(d) => {
                    report.counters.dedup_failed += 1;
                    ("withheld", Some(d.reason))
                }
                DedupOutcome::AlreadyDecided(_) => ("already_decided", None),
                DedupOutcome::Failed { error, .. } => {
                    report.counters.dedup_failed += 1;
                    ("failed", Some(error))
                }
                DedupOutcome::StoreError { item_id, error } => {
                    report
                        .warnings
                        .push(format!("item {item_id}: decision not saved: {error}"));
                    ("store_error", Some(error))
                }
            };
            report.items.push(ItemReport {
                item_id: candidate.item.id,
                stage: "dedup",
                outcome: outcome.to_string(),
                detail,
            });
        }
    }

    async fn publish(&self, report: &mut RunReport) {
        let since = self.dedup.window_start();
        let candidates = match self
            .store
            .pending_publications(since, self.min_importance, self.publish_limit)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "could not list publish candidates");
                report.warnings.push(format!("publish: {e}"));
                return;
            }
        };

        for c in &candidates {
            let outcome = self
                .publications
                .publish_gated(c, self.sink.as_ref(), &self.target, self.min_importance)
                .await;
            let detail = match &outcome {
                PublishOutcome::Published { message_id, .. } => {
                    report.counters.published += 1;
                    Some(message_id.clone())
                }
                PublishOutcome::Skipped { reason, .. } => {
                    report.counters.publish_skipped += 1;
                    Some(match reason {
                        PublishSkip::AlreadyReserved => "already reserved".to_string(),
                        PublishSkip::LowValue { importance } => format!("importance {importance}"),
                        PublishSkip::Duplicate { similarity, .. } => {
                            format!("similarity {similarity}")
                        }
                    })
                }
                PublishOutcome::Failed { error, .. } => {
                    report.counters.publish_failed += 1;
                    Some(error.clone())
                }
            };
            report.items.push(ItemReport {
                item_id: c.item.id,
                stage: "publish",
                outcome: outcome.label().to_string(),
                detail,
            });
        }
    }

    /// Drop publications older than the retention window.
    pub async fn prune(&self) -> Result<u64> {
        Ok(self.publications.prune(self.retention).await?)
    }

    pub async fn feed_status(&self, feeds: &[FeedConfig]) -> Result<Vec<FeedStatus>> {
        let now = self.clock.now();
        let mut out = Vec::with_capacity(feeds.len());
        for f in feeds {
            let state = self
                .store
                .load_feed_state(f.id())
                .await?
                .unwrap_or_else(|| crate::ingest::state::FeedState::initial(f.id()));
            out.push(FeedStatus {
                feed_id: f.id(),
                url: f.url().to_string(),
                enabled: f.enabled(),
                health: state.health(now),
                error_count: state.error_count,
                last_status: state.last_status,
                fetched_at: state.fetched_at,
                backoff_remaining_secs: state.backoff_remaining(now).num_seconds(),
            });
        }
        Ok(out)
    }
}
