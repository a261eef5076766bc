// src/ingest/runner.rs
//! One polling pass over a set of feeds.
//!
//! Per feed: gate on `enabled` and backoff, send one conditional GET, classify
//! the status, apply the matching [`FeedState`] transition and persist it
//! before returning. Feeds run on a bounded pool; a per-feed lock keeps two
//! passes from touching the same feed state at once.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::FeedConfig;
use crate::error::FetchError;
use crate::ingest::parser::FeedParser;
use crate::ingest::state::{BackoffPolicy, FeedState};
use crate::ingest::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::ingest::types::{FeedId, RawItem};
use crate::keyed_lock::KeyedLocks;
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    Backoff { until: DateTime<Utc> },
    /// Polled less than one interval ago (only in [`FetchRunner::run_due_feeds`]).
    NotDue,
    /// The persisted state could not be read, so the feed was left alone.
    StateUnavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// 2xx and parsed. `invalid` counts entries without title+link or guid.
    Fetched { items: Vec<RawItem>, invalid: usize },
    NotModified,
    Skipped(SkipReason),
    Failed(FetchError),
}

impl FetchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Fetched { .. } => "ok",
            FetchOutcome::NotModified => "not_modified",
            FetchOutcome::Skipped(_) => "skipped",
            FetchOutcome::Failed(e) => e.class(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub feed_id: FeedId,
    pub outcome: FetchOutcome,
    /// `None` when no request was sent; `Some(0)` for a transport failure.
    pub status: Option<u16>,
    /// State after this attempt (unchanged when skipped).
    pub state: FeedState,
    pub duration: Duration,
    pub body_bytes: usize,
    /// Set when the new state could not be saved.
    pub persist_error: Option<String>,
}

impl FetchResult {
    pub fn items(&self) -> &[RawItem] {
        match &self.outcome {
            FetchOutcome::Fetched { items, .. } => items,
            _ => &[],
        }
    }

    fn skipped(feed_id: FeedId, state: FeedState, reason: SkipReason) -> Self {
        Self {
            feed_id,
            outcome: FetchOutcome::Skipped(reason),
            status: None,
            state,
            duration: Duration::ZERO,
            body_bytes: 0,
            persist_error: None,
        }
    }
}

/// Informational counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchMetrics {
    /// Requests actually sent.
    pub attempts: usize,
    pub ok: usize,
    pub not_modified: usize,
    pub errors: usize,
    pub parse_errors: usize,
    pub items_parsed: usize,
    pub skipped: usize,
    pub duration: Duration,
    pub body_bytes: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchRun {
    pub results: BTreeMap<FeedId, FetchResult>,
    pub metrics: FetchMetrics,
}

impl FetchRun {
    fn from_results(results: BTreeMap<FeedId, FetchResult>, elapsed: Duration) -> Self {
        let mut m = FetchMetrics {
            duration: elapsed,
            ..Default::default()
        };
        for r in results.values() {
            if r.status.is_some() {
                m.attempts += 1;
            }
            m.body_bytes += r.body_bytes;
            match &r.outcome {
                FetchOutcome::Fetched { items, .. } => {
                    m.ok += 1;
                    m.items_parsed += items.len();
                }
                FetchOutcome::NotModified => m.not_modified += 1,
                FetchOutcome::Skipped(_) => m.skipped += 1,
                FetchOutcome::Failed(FetchError::Parse(_)) => m.parse_errors += 1,
                FetchOutcome::Failed(_) => m.errors += 1,
            }
        }
        Self { results, metrics: m }
    }
}

#[derive(Clone)]
pub struct FetchRunner {
    transport: Arc<dyn HttpTransport>,
    parser: Arc<dyn FeedParser>,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    policy: BackoffPolicy,
    locks: KeyedLocks<FeedId>,
    concurrency: usize,
}

impl FetchRunner {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        parser: Arc<dyn FeedParser>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            transport,
            parser,
            store,
            clock,
            policy,
            locks: KeyedLocks::new(),
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Fetch a single feed. Never fails: every problem ends up in the result.
    pub async fn run_for_feed(&self, feed: &FeedConfig) -> FetchResult {
        let id = feed.id();
        let _guard = self.locks.lock(&id).await;

        let state = match self.store.load_feed_state(id).await {
            Ok(s) => s.unwrap_or_else(|| FeedState::initial(id)),
            Err(e) => {
                warn!(feed_id = id, error = %e, "feed state unavailable, skipping");
                counter!("feedgate_fetch_total", "outcome" => "skipped").increment(1);
                return FetchResult::skipped(
                    id,
                    FeedState::initial(id),
                    SkipReason::StateUnavailable(e.to_string()),
                );
            }
        };

        if !feed.enabled() {
            debug!(feed_id = id, "feed disabled");
            counter!("feedgate_fetch_total", "outcome" => "skipped").increment(1);
            return FetchResult::skipped(id, state, SkipReason::Disabled);
        }

        let now = self.clock.now();
        if let Some(until) = state.backoff_until.filter(|_| state.is_in_backoff(now)) {
            debug!(
                feed_id = id,
                remaining_secs = state.backoff_remaining(now).num_seconds(),
                "feed in backoff"
            );
            counter!("feedgate_fetch_total", "outcome" => "skipped").increment(1);
            return FetchResult::skipped(id, state, SkipReason::Backoff { until });
        }

        let req = conditional_request(feed, &state);
        let started = Instant::now();
        let response = self.transport.request(&req).await;
        let now = self.clock.now();

        let (outcome, status, next, body_bytes) = match response {
            Err(e) => {
                let next = state.with_failed_fetch(0, None, &self.policy, now);
                (
                    FetchOutcome::Failed(FetchError::Network(format!("{e:#}"))),
                    0,
                    next,
                    0,
                )
            }
            Ok(rsp) => {
                let bytes = rsp.body.len();
                let (outcome, next) = self.classify(feed, state, rsp.status, &rsp, now);
                (outcome, rsp.status, next, bytes)
            }
        };
        let duration = started.elapsed();

        let persist_error = match self.store.save_feed_state(&next).await {
            Ok(()) => None,
            Err(e) => {
                warn!(feed_id = id, error = %e, "failed to persist feed state");
                Some(e.to_string())
            }
        };

        match &outcome {
            FetchOutcome::Fetched { items, invalid } => info!(
                feed_id = id,
                status,
                items = items.len(),
                invalid,
                bytes = body_bytes,
                "feed fetched"
            ),
            FetchOutcome::NotModified => debug!(feed_id = id, "feed not modified"),
            FetchOutcome::Failed(e) => warn!(
                feed_id = id,
                status,
                class = e.class(),
                error = %e,
                error_count = next.error_count,
                backoff_until = ?next.backoff_until,
                "feed fetch failed"
            ),
            FetchOutcome::Skipped(_) => {}
        }

        counter!("feedgate_fetch_total", "outcome" => outcome.label()).increment(1);
        counter!("feedgate_fetch_items_total").increment(
            match &outcome {
                FetchOutcome::Fetched { items, .. } => items.len() as u64,
                _ => 0,
            },
        );
        counter!("feedgate_fetch_body_bytes_total").increment(body_bytes as u64);
        histogram!("feedgate_fetch_ms").record(duration.as_secs_f64() * 1000.0);

        FetchResult {
            feed_id: id,
            outcome,
            status: Some(status),
            state: next,
            duration,
            body_bytes,
            persist_error,
        }
    }

    fn classify(
        &self,
        feed: &FeedConfig,
        state: FeedState,
        status: u16,
        rsp: &HttpResponse,
        now: DateTime<Utc>,
    ) -> (FetchOutcome, FeedState) {
        let etag = rsp.header("etag").map(str::to_string);
        let last_modified = rsp.header("last-modified").map(str::to_string);
        let retry_after = rsp
            .retry_after_secs()
            .map(|s| ChronoDuration::seconds(s.min(i64::MAX as u64) as i64));

        match status {
            304 => {
                // Servers may omit validators on 304; keep the ones we sent.
                let etag = etag.or_else(|| state.etag.clone());
                let last_modified = last_modified.or_else(|| state.last_modified.clone());
                (
                    FetchOutcome::NotModified,
                    state.with_successful_fetch(etag, last_modified, status, now),
                )
            }
            200..=299 => match self.parser.parse(&rsp.body, feed.parser_options()) {
                Ok(entries) => {
                    let total = entries.len();
                    let items: Vec<RawItem> = entries
                        .into_iter()
                        .filter_map(|e| RawItem::from_entry(feed.id(), e))
                        .collect();
                    let invalid = total - items.len();
                    (
                        FetchOutcome::Fetched { items, invalid },
                        state.with_successful_fetch(etag, last_modified, status, now),
                    )
                }
                Err(e) => (
                    FetchOutcome::Failed(FetchError::Parse(format!("{e:#}"))),
                    // Drop validators so the next pass downloads the body again.
                    state.with_successful_fetch(None, None, status, now),
                ),
            },
            500..=599 => (
                FetchOutcome::Failed(FetchError::Server(status)),
                state.with_failed_fetch(status, retry_after, &self.policy, now),
            ),
            400..=499 => (
                FetchOutcome::Failed(FetchError::Client(status)),
                state.with_failed_fetch(status, retry_after, &self.policy, now),
            ),
            _ => (
                FetchOutcome::Failed(FetchError::Unexpected(status)),
                state.with_failed_fetch(status, None, &self.policy, now),
            ),
        }
    }

    /// Fetch every feed on a bounded pool. One feed's failure never affects another.
    pub async fn run_for_all_feeds(&self, feeds: &[FeedConfig]) -> FetchRun {
        let started = Instant::now();
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for feed in feeds {
            let runner = self.clone();
            let feed = feed.clone();
            let sem = sem.clone();
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                runner.run_for_feed(&feed).await
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(r) => {
                    results.insert(r.feed_id, r);
                }
                Err(e) => warn!(error = %e, "fetch task aborted"),
            }
        }

        let run = FetchRun::from_results(results, started.elapsed());
        info!(
            feeds = feeds.len(),
            attempts = run.metrics.attempts,
            ok = run.metrics.ok,
            not_modified = run.metrics.not_modified,
            errors = run.metrics.errors,
            parse_errors = run.metrics.parse_errors,
            items = run.metrics.items_parsed,
            ms = run.metrics.duration.as_millis() as u64,
            "fetch pass done"
        );
        run
    }

    /// Like [`run_for_all_feeds`](Self::run_for_all_feeds), but feeds polled less
    /// than their own interval ago are reported as [`SkipReason::NotDue`].
    pub async fn run_due_feeds(&self, feeds: &[FeedConfig]) -> FetchRun {
        let started = Instant::now();
        let now = self.clock.now();
        let mut due = Vec::new();
        let mut not_due = BTreeMap::new();

        for feed in feeds {
            match self.store.load_feed_state(feed.id()).await {
                Ok(Some(state)) if feed.enabled() && !state.is_due(feed.interval(), now) => {
                    not_due.insert(
                        feed.id(),
                        FetchResult::skipped(feed.id(), state, SkipReason::NotDue),
                    );
                }
                _ => due.push(feed.clone()),
            }
        }

        let mut run = self.run_for_all_feeds(&due).await;
        run.results.extend(not_due);
        FetchRun::from_results(run.results, started.elapsed())
    }
}

fn conditional_request(feed: &FeedConfig, state: &FeedState) -> HttpRequest {
    let mut req = HttpRequest::get(feed.url());
    req.timeout = feed.timeout();
    req.retries = feed.retries();
    req.proxy = feed.proxy().map(str::to_string);
    req.headers = feed.headers().clone();
    if let Some(etag) = &state.etag {
        req.set_header("If-None-Match", etag.clone());
    }
    if let Some(lm) = &state.last_modified {
        req.set_header("If-Modified-Since", lm.clone());
    }
    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawFeedConfig;

    #[test]
    fn validators_become_conditional_headers() {
        let feed = FeedConfig::new(RawFeedConfig::new(1, "https://a.test/rss")).unwrap();
        let mut state = FeedState::initial(1);
        state.etag = Some("\"v1\"".into());
        state.last_modified = Some("Sat, 06 Sep 2025 09:00:00 GMT".into());
        let req = conditional_request(&feed, &state);
        assert_eq!(req.header("if-none-match"), Some("\"v1\""));
        assert_eq!(
            req.header("if-modified-since"),
            Some("Sat, 06 Sep 2025 09:00:00 GMT")
        );
        assert_eq!(req.timeout, Duration::from_secs(30));
        assert_eq!(req.retries, 2);
    }

    #[test]
    fn configured_validator_headers_are_replaced_not_doubled() {
        let mut raw = RawFeedConfig::new(1, "https://a.test/rss");
        raw.headers.insert("if-none-match".into(), "\"stale\"".into());
        raw.headers.insert("IF-MODIFIED-SINCE".into(), "yesterday".into());
        let feed = FeedConfig::new(raw).unwrap();
        let mut state = FeedState::initial(1);
        state.etag = Some("\"v2\"".into());
        state.last_modified = Some("Sat, 06 Sep 2025 09:00:00 GMT".into());

        let req = conditional_request(&feed, &state);
        let etags: Vec<_> = req
            .headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("if-none-match"))
            .collect();
        assert_eq!(etags.len(), 1);
        assert_eq!(req.header("if-none-match"), Some("\"v2\""));
        assert_eq!(
            req.headers
                .keys()
                .filter(|k| k.eq_ignore_ascii_case("if-modified-since"))
                .count(),
            1
        );
    }

    #[test]
    fn no_validators_no_conditional_headers() {
        let feed = FeedConfig::new(RawFeedConfig::new(1, "https://a.test/rss")).unwrap();
        let req = conditional_request(&feed, &FeedState::initial(1));
        assert!(req.header("if-none-match").is_none());
        assert!(req.header("if-modified-since").is_none());
    }
}
