// src/ingest/parser.rs
//! Feed body → ordered entries. RSS 2.0, RSS 1.0 (RDF) and Atom 1.0.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use quick_xml::de::from_str;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use std::collections::BTreeMap;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::ingest::types::{Enclosure, RawEntry};

/// Typed view of a feed's `parser_options` map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParserOptions {
    /// Keep only the first N entries, in document order.
    pub max_items: Option<usize>,
    /// Drop entries that carry no parsable publish date.
    pub require_date: bool,
}

impl ParserOptions {
    pub fn from_map(map: &BTreeMap<String, String>) -> Result<Self, String> {
        let mut out = Self::default();
        for (k, v) in map {
            match k.as_str() {
                "max_items" => {
                    let n: usize = v
                        .trim()
                        .parse()
                        .map_err(|_| format!("max_items must be a positive integer, got {v:?}"))?;
                    if n == 0 {
                        return Err("max_items must be > 0".to_string());
                    }
                    out.max_items = Some(n);
                }
                "require_date" => {
                    out.require_date = match v.trim().to_ascii_lowercase().as_str() {
                        "true" | "1" | "yes" => true,
                        "false" | "0" | "no" => false,
                        other => return Err(format!("require_date must be a boolean, got {other:?}")),
                    };
                }
                other => return Err(format!("unknown parser option {other:?}")),
            }
        }
        Ok(out)
    }
}

pub trait FeedParser: Send + Sync {
    fn parse(&self, body: &[u8], options: &ParserOptions) -> Result<Vec<RawEntry>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Rss,
    Rdf,
    Atom,
}

/// quick-xml backed parser.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlFeedParser;

impl FeedParser for XmlFeedParser {
    fn parse(&self, body: &[u8], options: &ParserOptions) -> Result<Vec<RawEntry>> {
        let text = String::from_utf8_lossy(body);
        let text = text.trim_start_matches('\u{feff}');
        let xml = scrub_html_entities_for_xml(text);

        let mut entries: Vec<RawEntry> = match detect_dialect(&xml)? {
            Dialect::Rss => {
                let rss: Rss = from_str(&xml).context("parsing rss xml")?;
                rss.channel.items.into_iter().map(RssItem::into_entry).collect()
            }
            Dialect::Rdf => {
                let rdf: Rdf = from_str(&xml).context("parsing rdf xml")?;
                rdf.items.into_iter().map(RssItem::into_entry).collect()
            }
            Dialect::Atom => {
                let feed: AtomFeed = from_str(&xml).context("parsing atom xml")?;
                feed.entries.into_iter().map(AtomEntry::into_entry).collect()
            }
        };

        if options.require_date {
            entries.retain(|e| e.published_at.is_some());
        }
        if let Some(n) = options.max_items {
            entries.truncate(n);
        }
        Ok(entries)
    }
}

fn detect_dialect(xml: &str) -> Result<Dialect> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event().context("reading xml root")? {
            Event::Start(e) | Event::Empty(e) => {
                return match e.local_name().as_ref() {
                    b"rss" => Ok(Dialect::Rss),
                    b"RDF" => Ok(Dialect::Rdf),
                    b"feed" => Ok(Dialect::Atom),
                    other => Err(anyhow!(
                        "unrecognized feed root element <{}>",
                        String::from_utf8_lossy(other)
                    )),
                };
            }
            Event::Eof => bail!("empty document"),
            _ => {}
        }
    }
}

// --- RSS ---

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct Rdf {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct RssEnclosure {
    #[serde(rename = "@url")]
    url: String,
    #[serde(rename = "@type", default)]
    mime: Option<String>,
    #[serde(rename = "@length", default)]
    length: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Text>,
    description: Option<String>,
    #[serde(rename = "encoded", alias = "content:encoded")]
    encoded: Option<String>,
    author: Option<String>,
    #[serde(rename = "creator", alias = "dc:creator", default)]
    creators: Vec<String>,
    #[serde(rename = "category", default)]
    categories: Vec<Text>,
    enclosure: Option<RssEnclosure>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    #[serde(rename = "date", alias = "dc:date")]
    dc_date: Option<String>,
}

impl RssItem {
    fn into_entry(self) -> RawEntry {
        let mut authors: Vec<String> = self.author.into_iter().collect();
        authors.extend(self.creators);

        let published_at = self
            .pub_date
            .as_deref()
            .and_then(parse_rfc2822)
            .or_else(|| self.dc_date.as_deref().and_then(parse_rfc3339));

        RawEntry {
            title: self.title,
            link: self.link,
            guid: self.guid.map(|g| g.value),
            summary: self.description,
            content: self.encoded,
            authors,
            categories: self.categories.into_iter().map(|c| c.value).collect(),
            enclosure: self.enclosure.map(|e| Enclosure {
                url: e.url,
                mime: e.mime,
                length: e.length.and_then(|l| l.trim().parse().ok()),
            }),
            published_at,
        }
    }
}

// --- Atom ---

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: String,
    #[serde(rename = "@rel", default)]
    rel: Option<String>,
    #[serde(rename = "@type", default)]
    mime: Option<String>,
    #[serde(rename = "@length", default)]
    length: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomPerson {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomCategory {
    #[serde(rename = "@term", default)]
    term: Option<String>,
    #[serde(rename = "@label", default)]
    label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<Text>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    id: Option<String>,
    summary: Option<Text>,
    content: Option<Text>,
    #[serde(rename = "author", default)]
    authors: Vec<AtomPerson>,
    #[serde(rename = "category", default)]
    categories: Vec<AtomCategory>,
    published: Option<String>,
    updated: Option<String>,
}

impl AtomEntry {
    fn into_entry(self) -> RawEntry {
        let mut link = None;
        let mut enclosure = None;
        for l in self.links {
            match l.rel.as_deref().unwrap_or("alternate") {
                "alternate" if link.is_none() => link = Some(l.href),
                "enclosure" if enclosure.is_none() => {
                    enclosure = Some(Enclosure {
                        url: l.href,
                        mime: l.mime,
                        length: l.length.and_then(|v| v.trim().parse().ok()),
                    })
                }
                _ => {}
            }
        }

        let published_at = self
            .published
            .as_deref()
            .or(self.updated.as_deref())
            .and_then(parse_rfc3339);

        RawEntry {
            title: self.title.map(|t| t.value),
            link,
            guid: self.id,
            summary: self.summary.map(|t| t.value),
            content: self.content.map(|t| t.value),
            authors: self.authors.into_iter().filter_map(|a| a.name).collect(),
            categories: self
                .categories
                .into_iter()
                .filter_map(|c| c.term.or(c.label))
                .collect(),
            enclosure,
            published_at,
        }
    }
}

// --- helpers ---

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    let ts = ts.trim();
    OffsetDateTime::parse(ts, &Rfc2822)
        .ok()
        .and_then(|dt| DateTime::from_timestamp(dt.unix_timestamp(), dt.nanosecond()))
        .or_else(|| {
            DateTime::parse_from_rfc2822(ts)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Replace HTML-only named entities that would break an XML parser.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", "&#160;")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
        .replace("&copy;", "(c)")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>T</title>
    <item>
      <title>First &amp; best</title>
      <link>https://n.test/1</link>
      <guid isPermaLink="false">id-1</guid>
      <description>One&nbsp;two</description>
      <category>Markets</category>
      <category domain="x">Rates</category>
      <pubDate>Sat, 06 Sep 2025 09:00:00 +0000</pubDate>
      <enclosure url="https://n.test/1.mp3" type="audio/mpeg" length="1234"/>
    </item>
    <item>
      <title>Second</title>
      <link>https://n.test/2</link>
    </item>
  </channel>
</rss>"#;

    #[test]
    fn parses_rss_items_in_order() {
        let out = XmlFeedParser
            .parse(RSS.as_bytes(), &ParserOptions::default())
            .unwrap();
        assert_eq!(out.len(), 2);
        let first = &out[0];
        assert_eq!(first.title.as_deref(), Some("First & best"));
        assert_eq!(first.guid.as_deref(), Some("id-1"));
        assert_eq!(first.categories, vec!["Markets", "Rates"]);
        let enc = first.enclosure.as_ref().unwrap();
        assert_eq!(enc.length, Some(1234));
        assert_eq!(
            first.published_at.unwrap().to_rfc3339(),
            "2025-09-06T09:00:00+00:00"
        );
        assert_eq!(out[1].title.as_deref(), Some("Second"));
    }

    #[test]
    fn options_truncate_and_filter() {
        let opts = ParserOptions {
            max_items: Some(5),
            require_date: true,
        };
        let out = XmlFeedParser.parse(RSS.as_bytes(), &opts).unwrap();
        assert_eq!(out.len(), 1);

        let opts = ParserOptions {
            max_items: Some(1),
            require_date: false,
        };
        assert_eq!(XmlFeedParser.parse(RSS.as_bytes(), &opts).unwrap().len(), 1);
    }

    #[test]
    fn unknown_root_is_an_error() {
        let err = XmlFeedParser
            .parse(b"<html><body/></html>", &ParserOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("html"));
    }

    #[test]
    fn option_map_is_validated() {
        let mut m = BTreeMap::new();
        m.insert("max_items".to_string(), "10".to_string());
        assert_eq!(ParserOptions::from_map(&m).unwrap().max_items, Some(10));
        m.insert("bogus".to_string(), "1".to_string());
        assert!(ParserOptions::from_map(&m).is_err());
    }
}
