// tests/fetch_runner.rs
mod common;

use chrono::Duration;
use std::sync::Arc;

use common::{clock, feed, ok, rss, status, ScriptedTransport};
use feedgate::clock::{Clock, ManualClock};
use feedgate::config::RawFeedConfig;
use feedgate::error::FetchError;
use feedgate::ingest::parser::XmlFeedParser;
use feedgate::ingest::runner::{FetchOutcome, FetchRunner, SkipReason};
use feedgate::ingest::state::BackoffPolicy;
use feedgate::ingest::transport::HttpResponse;
use feedgate::store::{MemoryStore, Store};
use feedgate::FeedConfig;

const URL: &str = "https://news.test/rss";

fn runner(
    transport: &Arc<ScriptedTransport>,
    store: &Arc<MemoryStore>,
    clock: &Arc<ManualClock>,
) -> FetchRunner {
    FetchRunner::new(
        transport.clone(),
        Arc::new(XmlFeedParser),
        store.clone(),
        clock.clone(),
        BackoffPolicy::default(),
    )
}

#[tokio::test]
async fn etag_round_trip_yields_not_modified() {
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let runner = runner(&transport, &store, &clock);
    let f = feed(1, URL);

    transport.push(
        URL,
        ok(
            rss(&[
                ("One", "https://news.test/1"),
                ("Two", "https://news.test/2"),
                ("Three", "https://news.test/3"),
            ]),
            Some("\"v1\""),
        ),
    );
    transport.push(URL, status(304));

    let first = runner.run_for_feed(&f).await;
    assert_eq!(first.items().len(), 3);
    assert_eq!(first.status, Some(200));
    assert_eq!(first.state.etag.as_deref(), Some("\"v1\""));

    clock.advance(Duration::minutes(20));
    let second = runner.run_for_feed(&f).await;
    assert_eq!(second.outcome, FetchOutcome::NotModified);
    assert!(second.items().is_empty());
    assert_eq!(second.state.error_count, 0);
    // Validators survive a 304 that does not repeat them.
    assert_eq!(second.state.etag.as_deref(), Some("\"v1\""));

    let reqs = transport.requests_to(URL);
    assert_eq!(reqs.len(), 2);
    assert!(reqs[0].header("if-none-match").is_none());
    assert_eq!(reqs[1].header("if-none-match"), Some("\"v1\""));

    let persisted = store.load_feed_state(1).await.unwrap().unwrap();
    assert_eq!(persisted, second.state);
}

#[tokio::test]
async fn repeated_server_errors_grow_backoff_and_skip_inside_it() {
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let runner = runner(&transport, &store, &clock);
    let f = feed(7, URL);
    for _ in 0..3 {
        transport.push(URL, status(503));
    }

    let mut previous_until = None;
    for expected_errors in 1..=3u32 {
        let r = runner.run_for_feed(&f).await;
        assert_eq!(r.outcome, FetchOutcome::Failed(FetchError::Server(503)));
        assert_eq!(r.state.error_count, expected_errors);
        let until = r.state.backoff_until.expect("backoff set");
        assert!(until > clock.now());
        if let Some(prev) = previous_until {
            assert!(until > prev, "backoff must grow: {until} <= {prev}");
        }
        previous_until = Some(until);
        // Jump past the deadline so the next pass actually fetches.
        clock.set(until + Duration::seconds(1));
    }

    // Fourth pass lands inside the third backoff window.
    let state = store.load_feed_state(7).await.unwrap().unwrap();
    clock.set(state.backoff_until.unwrap() - Duration::seconds(10));
    let r = runner.run_for_feed(&f).await;
    assert!(matches!(
        r.outcome,
        FetchOutcome::Skipped(SkipReason::Backoff { .. })
    ));
    assert_eq!(r.status, None);
    assert_eq!(r.state.error_count, 3);
    assert_eq!(transport.requests_to(URL).len(), 3);
}

#[tokio::test]
async fn success_after_failures_clears_the_streak() {
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let runner = runner(&transport, &store, &clock);
    let f = feed(2, URL);

    transport.push_err(URL, "connection reset");
    transport.push(URL, ok(rss(&[("A", "https://news.test/a")]), None));

    let failed = runner.run_for_feed(&f).await;
    assert_eq!(failed.status, Some(0));
    assert!(matches!(
        failed.outcome,
        FetchOutcome::Failed(FetchError::Network(_))
    ));
    assert_eq!(failed.outcome.label(), "network");

    clock.advance(Duration::hours(2));
    let ok = runner.run_for_feed(&f).await;
    assert_eq!(ok.items().len(), 1);
    assert_eq!(ok.state.error_count, 0);
    assert!(ok.state.backoff_until.is_none());
}

#[tokio::test]
async fn disabled_feed_is_never_requested() {
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let runner = runner(&transport, &store, &clock);

    let mut raw = RawFeedConfig::new(3, URL);
    raw.enabled = false;
    let f = FeedConfig::new(raw).unwrap();

    let r = runner.run_for_feed(&f).await;
    assert_eq!(r.outcome, FetchOutcome::Skipped(SkipReason::Disabled));
    assert!(transport.requests().is_empty());
}

#[tokio::test]
async fn one_failing_feed_does_not_affect_the_others() {
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let runner = runner(&transport, &store, &clock).with_concurrency(2);

    let feeds = vec![
        feed(1, "https://a.test/rss"),
        feed(2, "https://b.test/rss"),
        feed(3, "https://c.test/rss"),
    ];
    transport.push("https://a.test/rss", ok(rss(&[("A1", "https://a.test/1")]), None));
    transport.push("https://b.test/rss", status(500));
    transport.push(
        "https://c.test/rss",
        ok(
            rss(&[("C1", "https://c.test/1"), ("C2", "https://c.test/2")]),
            None,
        ),
    );

    let run = runner.run_for_all_feeds(&feeds).await;
    assert_eq!(run.results.len(), 3);
    assert_eq!(run.results[&1].items().len(), 1);
    assert_eq!(run.results[&2].state.error_count, 1);
    assert_eq!(run.results[&3].items().len(), 2);
    assert_eq!(run.metrics.attempts, 3);
    assert_eq!(run.metrics.ok, 2);
    assert_eq!(run.metrics.errors, 1);
    assert_eq!(run.metrics.items_parsed, 3);
}

#[tokio::test]
async fn unparsable_body_clears_validators_without_backoff() {
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let runner = runner(&transport, &store, &clock);
    let f = feed(4, URL);

    transport.push(URL, ok(b"<html><body>maintenance</body></html>".to_vec(), Some("\"x\"")));
    transport.push(URL, ok(rss(&[("Back", "https://news.test/back")]), None));

    let r = runner.run_for_feed(&f).await;
    assert!(matches!(r.outcome, FetchOutcome::Failed(FetchError::Parse(_))));
    assert_eq!(r.state.error_count, 0);
    assert!(r.state.etag.is_none());

    let again = runner.run_for_feed(&f).await;
    assert!(transport.requests_to(URL)[1].header("if-none-match").is_none());
    assert_eq!(again.items().len(), 1);
}

#[tokio::test]
async fn retry_after_overrides_policy_delay() {
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let runner = runner(&transport, &store, &clock);
    let f = feed(5, URL);

    let mut rsp = HttpResponse {
        status: 429,
        ..Default::default()
    };
    rsp.headers.insert("retry-after".into(), "600".into());
    transport.push(URL, rsp);

    let r = runner.run_for_feed(&f).await;
    assert_eq!(r.outcome, FetchOutcome::Failed(FetchError::Client(429)));
    assert_eq!(
        r.state.backoff_until,
        Some(clock.now() + Duration::seconds(600))
    );
}

#[tokio::test]
async fn due_pass_skips_recently_polled_feeds() {
    let transport = ScriptedTransport::new();
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    let runner = runner(&transport, &store, &clock);
    let f = feed(6, URL);

    transport.push(URL, ok(rss(&[("A", "https://news.test/a")]), None));
    transport.push(URL, status(304));

    let run = runner.run_due_feeds(std::slice::from_ref(&f)).await;
    assert_eq!(run.results[&6].items().len(), 1);

    clock.advance(Duration::minutes(5));
    let run = runner.run_due_feeds(std::slice::from_ref(&f)).await;
    assert_eq!(
        run.results[&6].outcome,
        FetchOutcome::Skipped(SkipReason::NotDue)
    );
    assert_eq!(run.metrics.skipped, 1);

    // Default interval is 15 minutes.
    clock.advance(Duration::minutes(10));
    let run = runner.run_due_feeds(std::slice::from_ref(&f)).await;
    assert_eq!(run.results[&6].outcome, FetchOutcome::NotModified);
    assert_eq!(transport.requests_to(URL).len(), 2);
}
