// src/analyze/mod.rs
//! AI enrichment: summarization and semantic dedup, plus the shared JSON answer handling.

pub mod ai_adapter;
pub mod dedup;
pub mod prompt;
pub mod summarize;

use serde_json::Value;

use crate::error::AiParseError;

pub use ai_adapter::{AiClient, CompletionOptions, DynAiClient, MockClient};
pub use dedup::{DedupAnswer, DedupOutcome, DeduplicationService};
pub use summarize::{SummarizationService, SummaryAnswer, SummarizeReport};

/// First balanced `{...}` in `text`, parsed. Tolerates code fences and prose around it.
pub fn extract_json_object(text: &str) -> Result<Value, AiParseError> {
    let start = text.find('{').ok_or(AiParseError::NoJson)?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;
    let mut end = None;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_str {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_str = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_str = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    let end = end.ok_or_else(|| AiParseError::Malformed("unbalanced braces".into()))?;
    let value: Value = serde_json::from_str(&text[start..=end])
        .map_err(|e| AiParseError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(AiParseError::NoJson);
    }
    Ok(value)
}

/// Integer field that models sometimes send as `12`, `12.0` or `"12"`.
pub(crate) fn int_field(obj: &Value, field: &'static str) -> Result<i64, AiParseError> {
    let v = obj.get(field).ok_or(AiParseError::Missing(field))?;
    let n = match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    n.ok_or_else(|| AiParseError::OutOfRange {
        field,
        value: v.to_string(),
    })
}

/// Non-empty trimmed string field.
pub(crate) fn str_field(obj: &Value, field: &'static str) -> Result<String, AiParseError> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or(AiParseError::Missing(field))
}
