// src/ingest/mod.rs
//! Feed ingestion: polling state machine, transport and parser seams, and the
//! identity normalization behind the exact-match dedup tier.

pub mod parser;
pub mod runner;
pub mod state;
pub mod transport;
pub mod types;

use once_cell::sync::OnceCell;
use sha2::{Digest, Sha256};

pub use runner::{FetchMetrics, FetchOutcome, FetchResult, FetchRun, FetchRunner, SkipReason};
pub use state::{BackoffPolicy, FeedState, Health};
pub use types::{Enclosure, FeedId, RawEntry, RawItem};

/// Normalize text: decode entities, strip tags, straighten quotes, collapse whitespace.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, " ").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace('\u{00A0}', " ");

    // 4) Collapse whitespace
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").to_string();
    out = out.trim().to_string();

    // 5) Length cap: 4000 chars
    if out.chars().count() > 4000 {
        out = out.chars().take(4000).collect();
    }

    out
}

/// Case- and punctuation-insensitive form of a title.
pub fn normalize_title(s: &str) -> String {
    let mut out = normalize_text(s).to_lowercase();
    while let Some(last) = out.chars().last() {
        if matches!(last, '!' | '?' | '.' | ',' | ':' | ';') {
            out.pop();
        } else {
            break;
        }
    }
    out.trim_end().to_string()
}

/// Canonical form of a link: trimmed, lowercase scheme/host, no fragment, no trailing slash.
pub fn normalize_link(s: &str) -> String {
    let trimmed = s.trim();
    let Ok(mut url) = reqwest::Url::parse(trimmed) else {
        return trimmed.trim_end_matches('/').to_string();
    };
    url.set_fragment(None);
    url.as_str().trim_end_matches('/').to_string()
}

/// SHA-256 over the normalized (title, link, guid) identity, hex encoded.
///
/// Identical identities collapse to the same hash regardless of which feed
/// delivered them.
pub fn content_hash(title: &str, link: &str, guid: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_title(title).as_bytes());
    hasher.update([0x1f]);
    hasher.update(normalize_link(link).as_bytes());
    hasher.update([0x1f]);
    hasher.update(guid.map(str::trim).unwrap_or_default().as_bytes());
    format!("{:x}", hasher.finalize())
}
