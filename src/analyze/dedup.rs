// src/analyze/dedup.rs
//! Fuzzy dedup tier: compare a freshly analyzed item with a bounded window of
//! recently decided items and decide whether it may be published.
//!
//! `can_be_publish = similarity < threshold`. A duplicate joins the dedup group
//! of the item it matched, so that item's publication blocks it.
//!
//! An item whose answers stay unusable is retried on later passes, behind
//! fresh items, and withheld for good after `max_failed_runs` passes.

use chrono::Duration as ChronoDuration;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::ai_adapter::{sanitize_reason, CompletionOptions, DynAiClient};
use super::prompt::render_dedup_prompt;
use super::{extract_json_object, int_field};
use crate::clock::Clock;
use crate::config::{AiConfig, DedupConfig};
use crate::error::{AiParseError, StoreError};
use crate::ingest::normalize_title;
use crate::models::{hash_group_key, AnalyzedItem, DedupDecision, ItemId, WindowEntry};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupAnswer {
    pub similarity: u8,
    /// 1-based index into the window.
    pub matched_index: Option<usize>,
    pub reason: String,
}

/// Parse `{similarity, matched_index, reason}`. An index outside the window is dropped.
pub fn parse_dedup(text: &str, window_len: usize) -> Result<DedupAnswer, AiParseError> {
    let v = extract_json_object(text)?;
    let similarity = int_field(&v, "similarity")?;
    if !(0..=100).contains(&similarity) {
        return Err(AiParseError::OutOfRange {
            field: "similarity",
            value: similarity.to_string(),
        });
    }
    let matched_index = match v.get("matched_index") {
        None | Some(serde_json::Value::Null) => None,
        Some(_) => int_field(&v, "matched_index")
            .ok()
            .filter(|i| *i >= 1 && (*i as usize) <= window_len)
            .map(|i| i as usize),
    };
    let reason = v
        .get("reason")
        .and_then(|r| r.as_str())
        .map(|r| sanitize_reason(r, 300))
        .unwrap_or_default();
    Ok(DedupAnswer {
        similarity: similarity as u8,
        matched_index,
        reason,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    Decided(DedupDecision),
    /// Another run recorded a decision first.
    AlreadyDecided(ItemId),
    /// AI answers were unusable this pass; the item is retried on a later run.
    Failed { item_id: ItemId, error: String },
    /// Unusable on too many passes; a terminal non-publishable decision was stored.
    Withheld(DedupDecision),
    StoreError { item_id: ItemId, error: String },
}

#[derive(Clone)]
pub struct DeduplicationService {
    ai: DynAiClient,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    model: String,
    max_attempts: u32,
    options: CompletionOptions,
    threshold: u8,
    window: ChronoDuration,
    window_size: usize,
    lexical_shortcut: f64,
    max_failed_runs: u32,
}

impl DeduplicationService {
    pub fn new(ai: DynAiClient, store: Arc<dyn Store>, clock: Arc<dyn Clock>, model: impl Into<String>) -> Self {
        let d = DedupConfig::default();
        Self {
            ai,
            store,
            clock,
            model: model.into(),
            max_attempts: 3,
            options: CompletionOptions {
                temperature: 0.0,
                max_tokens: 200,
                timeout: Duration::from_secs(30),
            },
            threshold: d.threshold,
            window: ChronoDuration::hours(d.window_hours as i64),
            window_size: d.window_size,
            lexical_shortcut: d.lexical_shortcut,
            max_failed_runs: d.max_failed_runs,
        }
    }

    /// Apply the `[ai]` and `[dedup]` sections.
    pub fn configured(mut self, ai: &AiConfig, cfg: &DedupConfig) -> Self {
        self.model = cfg.model.clone().unwrap_or_else(|| ai.model.clone());
        self.max_attempts = ai.max_attempts.max(1);
        self.options.timeout = Duration::from_secs(ai.timeout_secs);
        self.threshold = cfg.threshold;
        self.window = ChronoDuration::hours(cfg.window_hours.min(876_000) as i64);
        self.window_size = cfg.window_size.max(1);
        self.lexical_shortcut = cfg.lexical_shortcut;
        self.max_failed_runs = cfg.max_failed_runs.max(1);
        self
    }

    pub fn with_threshold(mut self, threshold: u8) -> Self {
        self.threshold = threshold.min(100);
        self
    }

    /// `0.0` disables the title shortcut.
    pub fn with_lexical_shortcut(mut self, ratio: f64) -> Self {
        self.lexical_shortcut = ratio;
        self
    }

    pub fn with_max_failed_runs(mut self, runs: u32) -> Self {
        self.max_failed_runs = runs.max(1);
        self
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    /// Start of the comparison window.
    pub fn window_start(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now() - self.window
    }

    /// Decided items inside the window, newest first, without the candidate itself.
    pub async fn recent_window(&self, candidate: ItemId) -> Result<Vec<WindowEntry>, StoreError> {
        self.store
            .recent_window(self.window_start(), candidate, self.window_size)
            .await
    }

    /// Pure decision for one candidate against a given window.
    pub async fn evaluate(
        &self,
        candidate: &AnalyzedItem,
        window: &[WindowEntry],
    ) -> Result<DedupDecision, AiParseError> {
        let item_id = candidate.item.id;
        let own_key = hash_group_key(&candidate.item.item.content_hash);
        let compared_with: Vec<ItemId> = window.iter().map(|w| w.item_id).collect();

        if window.is_empty() {
            return Ok(DedupDecision {
                item_id,
                compared_with,
                matched_item: None,
                similarity: 0,
                can_be_publish: true,
                group_key: own_key,
                reason: "no prior items in window".into(),
                decided_at: self.clock.now(),
            });
        }

        let answer = match self.lexical_match(candidate, window) {
            Some(answer) => answer,
            None => self.ask(candidate, window).await?,
        };

        let matched = answer.matched_index.and_then(|i| window.get(i - 1));
        let can_be_publish = answer.similarity < self.threshold;
        let group_key = if can_be_publish {
            own_key
        } else {
            // No index from the AI: attach to the most recent window item.
            matched.unwrap_or(&window[0]).group_key.clone()
        };
        let matched_item = if can_be_publish {
            matched.map(|w| w.item_id)
        } else {
            Some(matched.unwrap_or(&window[0]).item_id)
        };

        Ok(DedupDecision {
            item_id,
            compared_with,
            matched_item,
            similarity: answer.similarity,
            can_be_publish,
            group_key,
            reason: answer.reason,
            decided_at: self.clock.now(),
        })
    }

    /// Near-identical titles are a certain duplicate; no AI call needed.
    fn lexical_match(&self, candidate: &AnalyzedItem, window: &[WindowEntry]) -> Option<DedupAnswer> {
        if self.lexical_shortcut <= 0.0 {
            return None;
        }
        let title = normalize_title(&candidate.item.item.title);
        if title.is_empty() {
            return None;
        }
        let (idx, score) = window
            .iter()
            .enumerate()
            .map(|(i, w)| (i, strsim::normalized_levenshtein(&title, &normalize_title(&w.title))))
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        (score >= self.lexical_shortcut).then(|| DedupAnswer {
            similarity: 100,
            matched_index: Some(idx + 1),
            reason: format!("near-identical title ({score:.2})"),
        })
    }

    async fn ask(&self, candidate: &AnalyzedItem, window: &[WindowEntry]) -> Result<DedupAnswer, AiParseError> {
        let summary = candidate
            .analysis
            .summary
            .as_deref()
            .unwrap_or(&candidate.item.item.summary);
        let prompt = render_dedup_prompt(&candidate.item.item.title, summary, window);

        let mut last_err = AiParseError::NoJson;
        for attempt in 1..=self.max_attempts {
            counter!("feedgate_ai_attempts_total", "kind" => "dedup").increment(1);
            let call = self.ai.complete(&prompt, &self.model, &self.options);
            let result = match tokio::time::timeout(self.options.timeout, call).await {
                Ok(Ok(text)) => parse_dedup(&text, window.len()),
                Ok(Err(e)) => Err(AiParseError::Api(format!("{e:#}"))),
                Err(_) => Err(AiParseError::Timeout(self.options.timeout.as_secs())),
            };
            match result {
                Ok(a) => return Ok(a),
                Err(e) => {
                    debug!(item_id = candidate.item.id, attempt, error = %e, "dedup attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Window lookup, evaluation and the decision insert for one item.
    pub async fn evaluate_and_record(&self, candidate: &AnalyzedItem) -> DedupOutcome {
        let item_id = candidate.item.id;
        let window = match self.recent_window(item_id).await {
            Ok(w) => w,
            Err(e) => {
                return DedupOutcome::StoreError {
                    item_id,
                    error: e.to_string(),
                }
            }
        };

        let decision = match self.evaluate(candidate, &window).await {
            Ok(d) => d,
            Err(e) => return self.record_failure(candidate, &window, e).await,
        };

        match self.store.insert_decision(&decision).await {
            Ok(true) => {
                info!(
                    item_id,
                    similarity = decision.similarity,
                    publishable = decision.can_be_publish,
                    group_key = %decision.group_key,
                    window = window.len(),
                    "dedup decided"
                );
                let label = if decision.can_be_publish { "unique" } else { "duplicate" };
                counter!("feedgate_dedup_total", "result" => label).increment(1);
                DedupOutcome::Decided(decision)
            }
            Ok(false) => DedupOutcome::AlreadyDecided(item_id),
            Err(e) => {
                warn!(item_id, error = %e, "decision save failed");
                DedupOutcome::StoreError {
                    item_id,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Count a pass without a usable answer; past the limit, store a withheld decision.
    async fn record_failure(
        &self,
        candidate: &AnalyzedItem,
        window: &[WindowEntry],
        e: AiParseError,
    ) -> DedupOutcome {
        let item_id = candidate.item.id;
        counter!("feedgate_ai_failed_total", "kind" => "dedup").increment(1);
        let now = self.clock.now();
        let failures = match self.store.record_dedup_failure(item_id, now).await {
            Ok(n) => n,
            Err(se) => {
                warn!(item_id, error = %se, "dedup failure count not saved");
                return DedupOutcome::Failed {
                    item_id,
                    error: e.to_string(),
                };
            }
        };
        if failures < self.max_failed_runs {
            warn!(item_id, failures, error = %e, "dedup failed, decision deferred");
            return DedupOutcome::Failed {
                item_id,
                error: e.to_string(),
            };
        }

        let decision = DedupDecision::withheld(
            item_id,
            &candidate.item.item.content_hash,
            window.iter().map(|w| w.item_id).collect(),
            format!("dedup failed after {failures} passes: {e}"),
            now,
        );
        match self.store.insert_decision(&decision).await {
            Ok(true) => {
                warn!(item_id, failures, error = %e, "dedup gave up, item withheld");
                counter!("feedgate_dedup_total", "result" => "withheld").increment(1);
                DedupOutcome::Withheld(decision)
            }
            Ok(false) => DedupOutcome::AlreadyDecided(item_id),
            Err(se) => DedupOutcome::StoreError {
                item_id,
                error: se.to_string(),
            },
        }
    }

    /// Decide up to `limit` analyzed items without a decision, one at a time,
    /// so each decision is visible to the next item's window. Nothing is
    /// claimed while the AI provider is disabled.
    pub async fn run_pending(
        &self,
        limit: usize,
    ) -> Result<Vec<(AnalyzedItem, DedupOutcome)>, StoreError> {
        if !self.ai.is_enabled() {
            debug!("AI provider disabled, dedup skipped");
            return Ok(Vec::new());
        }
        let pending = self.store.analyzed_without_decision(limit).await?;
        let mut out = Vec::with_capacity(pending.len());
        for candidate in pending {
            let outcome = self.evaluate_and_record(&candidate).await;
            out.push((candidate, outcome));
        }
        Ok(out)
    }
}
