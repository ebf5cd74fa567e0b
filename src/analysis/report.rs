//! Parsing of model output into an [`AnalysisReport`].
//!
//! Models wrap JSON in prose or markdown fences, or answer in plain text. The
//! extraction tries, in order:
//!
//! 1. A ```` ```json ```` code block
//! 2. A generic code block containing an object
//! 3. The whole response, when it starts with `{`
//! 4. The largest valid object anywhere, preferring later ones
//!
//! When nothing usable is found the report keeps the raw text.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::scheduler::job::AnalysisFocus;
use crate::storage::{AnalysisReport, ReportSection};

const SUMMARY_FALLBACK_CHARS: usize = 500;

/// Index of the `}` closing the object `s` starts with.
///
/// String literals and escapes are skipped.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => {
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
            }
            '{' if !in_string => {
                depth += 1;
            }
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

fn json_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```json\s*\n?([\s\S]*?)\n?```").expect("static pattern"))
}

fn generic_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(?:\w+)?\s*\n?([\s\S]*?)\n?```").expect("static pattern"))
}

/// First balanced object in `s` that parses.
fn parse_object_at(s: &str) -> Option<serde_json::Map<String, Value>> {
    let start = s.find('{')?;
    let end = find_matching_brace(&s[start..])?;
    match serde_json::from_str::<Value>(&s[start..=start + end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn largest_object(s: &str) -> Option<serde_json::Map<String, Value>> {
    let mut best: Option<(usize, serde_json::Map<String, Value>)> = None;
    for (start, _) in s.char_indices().filter(|(_, c)| *c == '{') {
        let Some(end) = find_matching_brace(&s[start..]) else {
            continue;
        };
        let candidate = &s[start..=start + end];
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(candidate) {
            // `>=` keeps the later of equal-sized objects
            if best.as_ref().map(|(len, _)| candidate.len() >= *len).unwrap_or(true) {
                best = Some((candidate.len(), map));
            }
        }
    }
    best.map(|(_, map)| map)
}

/// Extracts the JSON object of a model response.
pub fn extract_json_object(content: &str) -> Option<serde_json::Map<String, Value>> {
    let trimmed = content.trim();

    if let Some(caps) = json_block_regex().captures(trimmed) {
        if let Some(map) = caps.get(1).and_then(|m| parse_object_at(m.as_str())) {
            return Some(map);
        }
    }

    if let Some(caps) = generic_block_regex().captures(trimmed) {
        if let Some(map) = caps.get(1).and_then(|m| parse_object_at(m.as_str())) {
            return Some(map);
        }
    }

    if trimmed.starts_with('{') {
        if let Some(map) = parse_object_at(trimmed) {
            return Some(map);
        }
    }

    largest_object(trimmed)
}

/// A finding is a string, or an object whose most descriptive field is used.
fn finding_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Object(map) => ["description", "finding", "issue", "message", "title"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(|s| s.trim().to_string())
            .or_else(|| Some(value.to_string())),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn section_from(map: &serde_json::Map<String, Value>, focus: AnalysisFocus) -> ReportSection {
    let findings = match map.get(focus.as_str()) {
        Some(Value::Array(items)) => items.iter().filter_map(finding_text).collect(),
        Some(value) => finding_text(value).into_iter().collect(),
        None => Vec::new(),
    };
    ReportSection { focus, findings }
}

fn fallback_summary(content: &str) -> String {
    let first = content
        .trim()
        .split("\n\n")
        .next()
        .unwrap_or_default()
        .trim();
    first.chars().take(SUMMARY_FALLBACK_CHARS).collect()
}

/// Parses a model response into a report covering `focus`.
pub fn parse_report(content: &str, focus: &[AnalysisFocus]) -> AnalysisReport {
    let Some(map) = extract_json_object(content) else {
        return AnalysisReport {
            summary: fallback_summary(content),
            sections: Vec::new(),
            raw: Some(content.to_string()),
        };
    };

    let summary = map
        .get("summary")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let sections: Vec<ReportSection> = focus.iter().map(|f| section_from(&map, *f)).collect();

    // An object without any expected key is not a report.
    let recognized = !summary.is_empty() || focus.iter().any(|f| map.contains_key(f.as_str()));
    AnalysisReport {
        summary: if summary.is_empty() {
            fallback_summary(content)
        } else {
            summary
        },
        sections,
        raw: (!recognized).then(|| content.to_string()),
    }
}
