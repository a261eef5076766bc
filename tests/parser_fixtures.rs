// tests/parser_fixtures.rs
mod common;

use common::fixture;
use feedgate::ingest::parser::{FeedParser, ParserOptions, XmlFeedParser};
use feedgate::ingest::types::RawItem;

fn parse(name: &str) -> Vec<feedgate::ingest::types::RawEntry> {
    XmlFeedParser
        .parse(&fixture(name), &ParserOptions::default())
        .unwrap()
}

#[test]
fn rss2_entries_keep_document_order() {
    let entries = parse("rss2.xml");
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].title.as_deref(), Some("Ferry service resumes after storm"));
    assert_eq!(entries[0].guid.as_deref(), Some("gazette-1001"));
    assert_eq!(entries[0].authors, vec!["J. Doe"]);
    assert_eq!(entries[0].categories, vec!["Transport"]);
    assert_eq!(
        entries[1].published_at.unwrap().to_rfc3339(),
        "2025-09-05T18:00:00+00:00"
    );
}

#[test]
fn rss2_items_are_cleaned_and_validated() {
    let items: Vec<RawItem> = parse("rss2.xml")
        .into_iter()
        .filter_map(|e| RawItem::from_entry(9, e))
        .collect();
    // The third entry has no identity.
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].summary, "The morning ferry sailed on time again.");
    assert_eq!(items[1].summary, "Spending rises by 4% .");
    assert!(items.iter().all(|i| i.feed_id == 9));
    assert_ne!(items[0].content_hash, items[1].content_hash);
}

#[test]
fn atom_links_dates_and_enclosures() {
    let entries = parse("atom.xml");
    assert_eq!(entries.len(), 2);

    let comet = &entries[0];
    assert_eq!(comet.link.as_deref(), Some("https://obs.test/comet"));
    assert_eq!(comet.guid.as_deref(), Some("urn:obs:comet"));
    assert_eq!(
        comet.published_at.unwrap().to_rfc3339(),
        "2025-09-06T04:00:00+00:00"
    );
    let enc = comet.enclosure.as_ref().unwrap();
    assert_eq!(enc.url, "https://obs.test/comet.jpg");
    assert_eq!(enc.length, Some(2048));
    assert_eq!(comet.authors, vec!["Night Desk"]);
    assert_eq!(comet.categories, vec!["astronomy"]);

    // No <published>: falls back to <updated>.
    let repairs = RawItem::from_entry(1, entries[1].clone()).unwrap();
    assert_eq!(repairs.title, "Telescope & dome repairs");
    assert_eq!(repairs.summary, "Closed for a week.");
    assert_eq!(
        repairs.published_at.unwrap().to_rfc3339(),
        "2025-09-05T12:00:00+00:00"
    );
}

#[test]
fn rdf_items_are_read() {
    let entries = parse("rdf.xml");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].link.as_deref(), Some("https://lab.test/a"));
    assert!(entries[0].published_at.is_some());
}

#[test]
fn options_apply_to_fixtures() {
    let opts = ParserOptions {
        max_items: Some(1),
        require_date: false,
    };
    assert_eq!(XmlFeedParser.parse(&fixture("atom.xml"), &opts).unwrap().len(), 1);

    let opts = ParserOptions {
        max_items: None,
        require_date: true,
    };
    // The identity-less third rss entry has no date either.
    assert_eq!(XmlFeedParser.parse(&fixture("rss2.xml"), &opts).unwrap().len(), 2);
}

#[test]
fn truncated_document_is_an_error() {
    let body = fixture("rss2.xml");
    let cut = &body[..body.len() / 2];
    assert!(XmlFeedParser.parse(cut, &ParserOptions::default()).is_err());
}
