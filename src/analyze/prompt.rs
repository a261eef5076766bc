// src/analyze/prompt.rs
//! Prompt templates. `{{name}}` placeholders are replaced verbatim.

use crate::models::{StoredItem, WindowEntry};

pub const DEFAULT_SUMMARY_TEMPLATE: &str = r#"Analyze the following news item.

Title: {{title}}
Link: {{link}}
Published: {{published}}
Categories: {{categories}}
Text:
{{summary}}

Respond with one JSON object:
{"language": "<ISO 639-1 code of the item>", "importance": <integer 1-20, 20 = major breaking news>, "category": "<short topic label>", "summary": "<2-3 sentences in the item's language>"}"#;

/// Summarization prompt for one stored item.
pub fn render_summary_prompt(template: &str, stored: &StoredItem) -> String {
    let item = &stored.item;
    let published = item
        .published_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "unknown".to_string());
    let categories = if item.categories.is_empty() {
        "none".to_string()
    } else {
        item.categories.iter().cloned().collect::<Vec<_>>().join(", ")
    };
    let title = if item.title.is_empty() {
        item.guid.as_deref().unwrap_or_default()
    } else {
        item.title.as_str()
    };

    template
        .replace("{{title}}", title)
        .replace("{{link}}", &item.link)
        .replace("{{published}}", &published)
        .replace("{{categories}}", &categories)
        .replace("{{summary}}", &item.summary)
}

/// Semantic comparison of one candidate against a numbered window (1-based).
pub fn render_dedup_prompt(title: &str, summary: &str, window: &[WindowEntry]) -> String {
    let mut out = String::from(
        "Decide whether the CANDIDATE article reports the same event as any PREVIOUS article.\n\
         Compare the entities, facts and events involved, not the wording.\n\n",
    );
    out.push_str(&format!("CANDIDATE:\nTitle: {title}\nSummary: {summary}\n\nPREVIOUS:\n"));
    for (i, w) in window.iter().enumerate() {
        out.push_str(&format!(
            "[{}] Title: {}\n    Summary: {}\n",
            i + 1,
            w.title,
            w.summary
        ));
    }
    out.push_str(
        "\nRespond with one JSON object:\n\
         {\"similarity\": <integer 0-100, overlap with the closest PREVIOUS article>, \
         \"matched_index\": <number of that article, or null>, \
         \"reason\": \"<one sentence>\"}",
    );
    out
}
