// src/analyze/summarize.rs
//! Item enrichment: language, importance (1-20), category and a short summary.
//!
//! Each item is claimed with a `pending` row first, so it is analyzed at most
//! once even when two runs overlap. The final row is `success` or `failed`;
//! both are terminal.

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::ai_adapter::{CompletionOptions, DynAiClient};
use super::prompt::{render_summary_prompt, DEFAULT_SUMMARY_TEMPLATE};
use super::{extract_json_object, int_field, str_field};
use crate::clock::Clock;
use crate::config::{AiConfig, SummarizeConfig};
use crate::error::AiParseError;
use crate::models::{AiAnalysis, AnalysisStatus, ItemId, StoredItem};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryAnswer {
    pub language: String,
    pub importance: u8,
    pub category: String,
    pub summary: String,
}

/// Parse `{language, importance, category, summary}`. Importance must be 1..=20.
pub fn parse_summary(text: &str) -> Result<SummaryAnswer, AiParseError> {
    let v = extract_json_object(text)?;
    let importance = int_field(&v, "importance")?;
    if !(1..=20).contains(&importance) {
        return Err(AiParseError::OutOfRange {
            field: "importance",
            value: importance.to_string(),
        });
    }
    Ok(SummaryAnswer {
        language: str_field(&v, "language")?.to_lowercase(),
        importance: importance as u8,
        category: str_field(&v, "category")?.to_lowercase(),
        summary: str_field(&v, "summary")?,
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SummarizeReport {
    /// Final rows written by this call, ordered by item id.
    pub analyses: Vec<AiAnalysis>,
    pub succeeded: usize,
    pub failed: usize,
    /// Items another run had already claimed.
    pub skipped: usize,
    /// `(item_id, error)` for claims or saves that hit the store.
    pub store_errors: Vec<(ItemId, String)>,
}

enum ItemResult {
    Done(AiAnalysis),
    Claimed,
    StoreError(ItemId, String),
}

#[derive(Clone)]
pub struct SummarizationService {
    ai: DynAiClient,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    template: Arc<str>,
    model: String,
    fallback_model: Option<String>,
    max_attempts: u32,
    options: CompletionOptions,
    concurrency: usize,
}

impl SummarizationService {
    pub fn new(ai: DynAiClient, store: Arc<dyn Store>, clock: Arc<dyn Clock>, model: impl Into<String>) -> Self {
        Self {
            ai,
            store,
            clock,
            template: Arc::from(DEFAULT_SUMMARY_TEMPLATE),
            model: model.into(),
            fallback_model: None,
            max_attempts: 3,
            options: CompletionOptions::default(),
            concurrency: 4,
        }
    }

    /// Apply the `[ai]` and `[summarize]` sections.
    pub fn configured(mut self, ai: &AiConfig, cfg: &SummarizeConfig) -> Self {
        self.model = ai.model.clone();
        self.fallback_model = ai.fallback_model.clone();
        self.max_attempts = ai.max_attempts.max(1);
        self.options = CompletionOptions {
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            timeout: Duration::from_secs(ai.timeout_secs),
        };
        self.concurrency = cfg.concurrency.max(1);
        self
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Arc::from(template.into());
        self
    }

    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    pub fn with_concurrency(mut self, n: usize) -> Self {
        self.concurrency = n.max(1);
        self
    }

    /// Model for a 1-based attempt: the fallback takes the last attempt, if there is more than one.
    fn model_for(&self, attempt: u32) -> &str {
        match &self.fallback_model {
            Some(fb) if attempt == self.max_attempts && self.max_attempts > 1 => fb,
            _ => &self.model,
        }
    }

    /// Analyze up to `limit` items that have no analysis row yet.
    pub async fn run_pending(&self, limit: usize) -> Result<SummarizeReport, crate::error::StoreError> {
        let items = self.store.items_without_analysis(limit).await?;
        Ok(self.process(items).await)
    }

    /// Analyze every item independently. Nothing here aborts the batch.
    /// With the AI provider disabled nothing is claimed, so the items wait.
    pub async fn process(&self, items: Vec<StoredItem>) -> SummarizeReport {
        if !self.ai.is_enabled() {
            debug!(items = items.len(), "AI provider disabled, summarize skipped");
            return SummarizeReport::default();
        }
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        for item in items {
            let svc = self.clone();
            let sem = sem.clone();
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                svc.process_one(&item).await
            });
        }

        let mut report = SummarizeReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(ItemResult::Done(a)) => {
                    match a.status {
                        AnalysisStatus::Success => report.succeeded += 1,
                        _ => report.failed += 1,
                    }
                    report.analyses.push(a);
                }
                Ok(ItemResult::Claimed) => report.skipped += 1,
                Ok(ItemResult::StoreError(id, e)) => report.store_errors.push((id, e)),
                Err(e) => warn!(error = %e, "summarize task aborted"),
            }
        }
        report.analyses.sort_by_key(|a| a.item_id);
        report.store_errors.sort();

        if report.succeeded + report.failed + report.skipped > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                store_errors = report.store_errors.len(),
                "summarization pass done"
            );
        }
        report
    }

    async fn process_one(&self, stored: &StoredItem) -> ItemResult {
        let id = stored.id;
        match self.store.claim_analysis(id, self.clock.now()).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(item_id = id, "already claimed");
                return ItemResult::Claimed;
            }
            Err(e) => return ItemResult::StoreError(id, e.to_string()),
        }

        let prompt = render_summary_prompt(&self.template, stored);
        let mut last_err: Option<AiParseError> = None;
        let mut analysis = AiAnalysis::pending(id, self.clock.now());

        for attempt in 1..=self.max_attempts {
            let model = self.model_for(attempt).to_string();
            counter!("feedgate_ai_attempts_total", "kind" => "summarize").increment(1);
            analysis.attempts = attempt;
            analysis.model = Some(model.clone());

            match self.ask(&prompt, &model).await {
                Ok(answer) => {
                    analysis.status = AnalysisStatus::Success;
                    analysis.language = Some(answer.language);
                    analysis.importance = Some(answer.importance);
                    analysis.category = Some(answer.category);
                    analysis.summary = Some(answer.summary);
                    analysis.error = None;
                    last_err = None;
                    break;
                }
                Err(e) => {
                    debug!(item_id = id, attempt, model = %model, error = %e, "summary attempt failed");
                    last_err = Some(e);
                }
            }
        }

        if let Some(e) = last_err {
            warn!(item_id = id, attempts = analysis.attempts, error = %e, "summarization failed");
            counter!("feedgate_ai_failed_total", "kind" => "summarize").increment(1);
            analysis.status = AnalysisStatus::Failed;
            analysis.error = Some(e.to_string());
        } else {
            counter!("feedgate_ai_success_total", "kind" => "summarize").increment(1);
        }
        analysis.updated_at = self.clock.now();

        match self.store.complete_analysis(&analysis).await {
            Ok(true) => ItemResult::Done(analysis),
            Ok(false) => ItemResult::StoreError(id, "analysis row is no longer pending".into()),
            Err(e) => {
                warn!(item_id = id, error = %e, "analysis save failed");
                ItemResult::StoreError(id, e.to_string())
            }
        }
    }

    async fn ask(&self, prompt: &str, model: &str) -> Result<SummaryAnswer, AiParseError> {
        let call = self.ai.complete(prompt, model, &self.options);
        let text = match tokio::time::timeout(self.options.timeout, call).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => return Err(AiParseError::Api(format!("{e:#}"))),
            Err(_) => return Err(AiParseError::Timeout(self.options.timeout.as_secs())),
        };
        parse_summary(&text)
    }
}
