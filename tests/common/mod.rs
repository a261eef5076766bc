// tests/common/mod.rs
// Shared fakes: scripted HTTP transport, recording sink, webhook stub, feed builders.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use feedgate::clock::{Clock, ManualClock};
use feedgate::config::{FeedConfig, RawFeedConfig};
use feedgate::error::{PublishError, StoreError};
use feedgate::ingest::state::FeedState;
use feedgate::ingest::transport::{HttpRequest, HttpResponse, HttpTransport};
use feedgate::ingest::types::{FeedId, RawEntry, RawItem};
use feedgate::models::{
    AiAnalysis, AnalysisStatus, AnalyzedItem, DedupDecision, ItemId, Publication,
    PublishCandidate, StoredItem, WindowEntry,
};
use feedgate::notify::{MessageSink, OutboundMessage};
use feedgate::store::{MemoryStore, Store};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap()
}

pub fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(t0()))
}

pub fn feed(id: i64, url: &str) -> FeedConfig {
    FeedConfig::new(RawFeedConfig::new(id, url)).unwrap()
}

pub fn fixture(name: &str) -> Vec<u8> {
    let path = format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"));
    std::fs::read(&path).unwrap_or_else(|e| panic!("fixture {path}: {e}"))
}

/// RSS body with one `<item>` per `(title, link)`.
pub fn rss(items: &[(&str, &str)]) -> Vec<u8> {
    let mut s = String::from(r#"<?xml version="1.0"?><rss version="2.0"><channel><title>t</title>"#);
    for (title, link) in items {
        s.push_str(&format!(
            "<item><title>{title}</title><link>{link}</link><description>About {title}.</description></item>"
        ));
    }
    s.push_str("</channel></rss>");
    s.into_bytes()
}

pub fn item(feed_id: FeedId, title: &str, link: &str) -> RawItem {
    RawItem::from_entry(
        feed_id,
        RawEntry {
            title: Some(title.to_string()),
            link: Some(link.to_string()),
            summary: Some(format!("About {title}.")),
            ..Default::default()
        },
    )
    .unwrap()
}

pub fn ok(body: Vec<u8>, etag: Option<&str>) -> HttpResponse {
    let mut headers = std::collections::BTreeMap::new();
    if let Some(e) = etag {
        headers.insert("etag".to_string(), e.to_string());
    }
    HttpResponse {
        status: 200,
        headers,
        body,
    }
}

pub fn status(code: u16) -> HttpResponse {
    HttpResponse {
        status: code,
        ..Default::default()
    }
}

/// Replies are queued per url; `Err` simulates a transport failure.
/// An empty queue answers 404.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<HashMap<String, VecDeque<Result<HttpResponse, String>>>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, url: &str, reply: HttpResponse) {
        self.replies
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(Ok(reply));
    }

    pub fn push_err(&self, url: &str, err: &str) {
        self.replies
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(Err(err.to_string()));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, url: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url == url)
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn request(&self, req: &HttpRequest) -> anyhow::Result<HttpResponse> {
        self.requests.lock().unwrap().push(req.clone());
        let next = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&req.url)
            .and_then(|q| q.pop_front());
        match next {
            Some(Ok(r)) => Ok(r),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Ok(status(404)),
        }
    }
}

/// Records every message; can be told to fail.
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(String, OutboundMessage)>>,
    fail: Mutex<bool>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn sent(&self) -> Vec<(String, OutboundMessage)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn publish(
        &self,
        target: &str,
        message: &OutboundMessage,
    ) -> Result<String, PublishError> {
        if *self.fail.lock().unwrap() {
            return Err(PublishError::Transport("sink down".into()));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((target.to_string(), message.clone()));
        Ok(format!("msg-{}", sent.len()))
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

pub fn summary_json(importance: u8, summary: &str) -> String {
    format!(
        r#"{{"language":"en","importance":{importance},"category":"news","summary":"{summary}"}}"#
    )
}

pub fn dedup_json(similarity: u8, matched_index: Option<usize>) -> String {
    let idx = matched_index
        .map(|i| i.to_string())
        .unwrap_or_else(|| "null".to_string());
    format!(r#"{{"similarity":{similarity},"matched_index":{idx},"reason":"compared"}}"#)
}

/// Insert an item and give it a successful analysis.
pub async fn analyzed(
    store: &MemoryStore,
    clock: &ManualClock,
    title: &str,
    link: &str,
    importance: u8,
) -> ItemId {
    let (id, _) = store
        .insert_item(&item(1, title, link), clock.now())
        .await
        .unwrap();
    assert!(store.claim_analysis(id, clock.now()).await.unwrap());
    let done = AiAnalysis {
        status: AnalysisStatus::Success,
        language: Some("en".into()),
        importance: Some(importance),
        category: Some("economy".into()),
        summary: Some(format!("Summary of {title}.")),
        model: Some("m".into()),
        attempts: 1,
        ..AiAnalysis::pending(id, clock.now())
    };
    assert!(store.complete_analysis(&done).await.unwrap());
    id
}

pub async fn candidate(store: &MemoryStore, id: ItemId) -> PublishCandidate {
    PublishCandidate {
        item: store.get_item(id).await.unwrap().unwrap(),
        analysis: store.get_analysis(id).await.unwrap().unwrap(),
        decision: store.get_decision(id).await.unwrap().unwrap(),
    }
}

/// MemoryStore that can be told to fail selected writes.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    fail_hash: Mutex<Option<String>>,
    fail_state_writes: Mutex<bool>,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_insert_of(&self, content_hash: &str) {
        *self.fail_hash.lock().unwrap() = Some(content_hash.to_string());
    }

    pub fn fail_state_writes(&self, fail: bool) {
        *self.fail_state_writes.lock().unwrap() = fail;
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn load_feed_state(&self, feed_id: FeedId) -> Result<Option<FeedState>, StoreError> {
        self.inner.load_feed_state(feed_id).await
    }
    async fn save_feed_state(&self, state: &FeedState) -> Result<(), StoreError> {
        if *self.fail_state_writes.lock().unwrap() {
            return Err(StoreError::Other("disk full".into()));
        }
        self.inner.save_feed_state(state).await
    }
    async fn list_feed_states(&self) -> Result<Vec<FeedState>, StoreError> {
        self.inner.list_feed_states().await
    }
    async fn insert_item(
        &self,
        item: &RawItem,
        now: DateTime<Utc>,
    ) -> Result<(ItemId, bool), StoreError> {
        if self.fail_hash.lock().unwrap().as_deref() == Some(item.content_hash.as_str()) {
            return Err(StoreError::Other("constraint check failed".into()));
        }
        self.inner.insert_item(item, now).await
    }
    async fn get_item(&self, id: ItemId) -> Result<Option<StoredItem>, StoreError> {
        self.inner.get_item(id).await
    }
    async fn count_items(&self) -> Result<u64, StoreError> {
        self.inner.count_items().await
    }
    async fn items_without_analysis(&self, limit: usize) -> Result<Vec<StoredItem>, StoreError> {
        self.inner.items_without_analysis(limit).await
    }
    async fn claim_analysis(&self, item_id: ItemId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.claim_analysis(item_id, now).await
    }
    async fn complete_analysis(&self, analysis: &AiAnalysis) -> Result<bool, StoreError> {
        self.inner.complete_analysis(analysis).await
    }
    async fn get_analysis(&self, item_id: ItemId) -> Result<Option<AiAnalysis>, StoreError> {
        self.inner.get_analysis(item_id).await
    }
    async fn analyzed_without_decision(
        &self,
        limit: usize,
    ) -> Result<Vec<AnalyzedItem>, StoreError> {
        self.inner.analyzed_without_decision(limit).await
    }
    async fn record_dedup_failure(
        &self,
        item_id: ItemId,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        self.inner.record_dedup_failure(item_id, now).await
    }
    async fn insert_decision(&self, decision: &DedupDecision) -> Result<bool, StoreError> {
        self.inner.insert_decision(decision).await
    }
    async fn get_decision(&self, item_id: ItemId) -> Result<Option<DedupDecision>, StoreError> {
        self.inner.get_decision(item_id).await
    }
    async fn recent_window(
        &self,
        since: DateTime<Utc>,
        exclude: ItemId,
        limit: usize,
    ) -> Result<Vec<WindowEntry>, StoreError> {
        self.inner.recent_window(since, exclude, limit).await
    }
    async fn pending_publications(
        &self,
        since: DateTime<Utc>,
        min_importance: u8,
        limit: usize,
    ) -> Result<Vec<PublishCandidate>, StoreError> {
        self.inner
            .pending_publications(since, min_importance, limit)
            .await
    }
    async fn insert_publication(&self, publication: &Publication) -> Result<bool, StoreError> {
        self.inner.insert_publication(publication).await
    }
    async fn mark_published(
        &self,
        group_key: &str,
        message_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.inner.mark_published(group_key, message_id, at).await
    }
    async fn delete_reservation(&self, group_key: &str) -> Result<bool, StoreError> {
        self.inner.delete_reservation(group_key).await
    }
    async fn get_publication(&self, group_key: &str) -> Result<Option<Publication>, StoreError> {
        self.inner.get_publication(group_key).await
    }
    async fn prune_publications(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.inner.prune_publications(before).await
    }
}

/// Minimal HTTP/1.1 server that answers every request with one canned response.
pub struct HttpStub {
    pub url: String,
    hits: Arc<AtomicUsize>,
}

impl HttpStub {
    /// `response` is the raw status line, headers and body.
    pub async fn start(response: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    if read_request(&mut sock).await.is_ok() {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let _ = sock.write_all(response.as_bytes()).await;
                        let _ = sock.shutdown().await;
                    }
                });
            }
        });
        Self { url, hits }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn read_request(sock: &mut TcpStream) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut wanted: Option<usize> = None;
    loop {
        if let Some(total) = wanted {
            if buf.len() >= total {
                return Ok(());
            }
        } else if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let body_len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            wanted = Some(end + 4 + body_len);
            continue;
        }
        let n = sock.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
