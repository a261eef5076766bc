// tests/summarize.rs
mod common;

use std::sync::Arc;

use common::{clock, item, summary_json};
use feedgate::analyze::{MockClient, SummarizationService};
use feedgate::models::AnalysisStatus;
use feedgate::store::{MemoryStore, Store};

async fn seeded(n: usize) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for i in 1..=n {
        store
            .insert_item(
                &item(1, &format!("Story {i}"), &format!("https://n.test/{i}")),
                common::t0(),
            )
            .await
            .unwrap();
    }
    store
}

#[tokio::test]
async fn successful_answer_is_stored() {
    let store = seeded(1).await;
    let ai = Arc::new(MockClient::scripted([Ok(summary_json(12, "Rates held."))]));
    let svc = SummarizationService::new(ai.clone(), store.clone(), clock(), "main-model");

    let report = svc.run_pending(10).await.unwrap();
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);

    let a = store.get_analysis(1).await.unwrap().unwrap();
    assert_eq!(a.status, AnalysisStatus::Success);
    assert_eq!(a.importance, Some(12));
    assert_eq!(a.summary.as_deref(), Some("Rates held."));
    assert_eq!(a.category.as_deref(), Some("news"));
    assert_eq!(a.attempts, 1);
    assert_eq!(a.model.as_deref(), Some("main-model"));
    assert!(ai.calls()[0].prompt.contains("Story 1"));
}

#[tokio::test]
async fn bad_answer_is_retried() {
    let store = seeded(1).await;
    let ai = Arc::new(MockClient::scripted([
        Ok("I think this is important".to_string()),
        Ok(r#"{"language":"en","importance":42,"category":"x","summary":"y"}"#.to_string()),
        Ok(summary_json(5, "Third time lucky.")),
    ]));
    let svc = SummarizationService::new(ai.clone(), store.clone(), clock(), "m");

    let report = svc.run_pending(10).await.unwrap();
    assert_eq!(report.succeeded, 1);
    let a = &report.analyses[0];
    assert_eq!(a.attempts, 3);
    assert_eq!(a.importance, Some(5));
    assert_eq!(ai.call_count(), 3);
}

#[tokio::test]
async fn fallback_model_takes_the_last_attempt() {
    let store = seeded(1).await;
    let ai = Arc::new(MockClient::scripted([
        Err("HTTP 500".to_string()),
        Ok(summary_json(9, "From the fallback.")),
    ]));
    let svc = SummarizationService::new(ai.clone(), store.clone(), clock(), "primary")
        .with_max_attempts(2)
        .with_fallback_model("backup");

    let report = svc.run_pending(10).await.unwrap();
    assert_eq!(report.succeeded, 1);
    let models: Vec<_> = ai.calls().into_iter().map(|c| c.model).collect();
    assert_eq!(models, vec!["primary", "backup"]);
    assert_eq!(report.analyses[0].model.as_deref(), Some("backup"));
}

#[tokio::test]
async fn exhausted_item_is_marked_failed_and_the_batch_continues() {
    let store = seeded(2).await;
    // Item 1 burns both attempts, item 2 succeeds first time.
    let ai = Arc::new(MockClient::scripted([
        Ok("nope".to_string()),
        Ok("still nope".to_string()),
        Ok(summary_json(3, "Fine.")),
    ]));
    let svc = SummarizationService::new(ai, store.clone(), clock(), "m")
        .with_max_attempts(2)
        .with_concurrency(1);

    let report = svc.run_pending(10).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);

    let first = store.get_analysis(1).await.unwrap().unwrap();
    assert_eq!(first.status, AnalysisStatus::Failed);
    assert_eq!(first.attempts, 2);
    assert!(first.error.unwrap().contains("no JSON object"));

    let second = store.get_analysis(2).await.unwrap().unwrap();
    assert_eq!(second.status, AnalysisStatus::Success);

    // Failed rows are terminal: nothing is picked up again.
    assert!(store.items_without_analysis(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn an_item_is_analyzed_at_most_once() {
    let store = seeded(1).await;
    let ai = Arc::new(MockClient::offline());
    let svc = SummarizationService::new(ai.clone(), store.clone(), clock(), "m");

    let items = store.items_without_analysis(10).await.unwrap();
    let first = svc.process(items.clone()).await;
    let again = svc.process(items).await;

    assert_eq!(first.succeeded, 1);
    assert_eq!(again.succeeded, 0);
    assert_eq!(again.skipped, 1);
    assert_eq!(ai.call_count(), 1);
}

#[tokio::test]
async fn custom_template_is_rendered() {
    let store = seeded(1).await;
    let ai = Arc::new(MockClient::offline());
    let svc = SummarizationService::new(ai.clone(), store.clone(), clock(), "m")
        .with_template("Headline: {{title}} / {{link}}");

    svc.run_pending(10).await.unwrap();
    assert_eq!(
        ai.calls()[0].prompt,
        "Headline: Story 1 / https://n.test/1"
    );
}
