//! Parsing helpers for model responses.

use crate::retrieval::RetrievalResult;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

static CITATION_MARKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d+)\]").expect("valid regex"));
static TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));
static EXCESS_NEWLINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Placeholder used when no passages were retrieved.
pub const NO_PASSAGES: &str = "[No relevant passages found]";

/// Extract the JSON payload from a response that may wrap it in prose or a
/// markdown fence.
pub fn extract_json(text: &str) -> &str {
    let mut text = text.trim();

    // ```json ... ``` or bare ``` ... ```
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            text = after[..end].trim();
        }
    }

    // Widest {...} span.
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

/// Parse JSON out of a model response, retrying once with trailing commas
/// removed.
pub fn parse_json<T: DeserializeOwned>(response: &str) -> Result<T, String> {
    let payload = extract_json(response);
    match serde_json::from_str(payload) {
        Ok(value) => Ok(value),
        Err(first) => {
            let repaired = TRAILING_COMMA.replace_all(payload, "$1");
            serde_json::from_str(&repaired).map_err(|_| format!("{first}: {payload}"))
        }
    }
}

/// Citation numbers in order of appearance, e.g. `[1]`, `[3]`.
pub fn extract_citation_markers(text: &str) -> Vec<usize> {
    CITATION_MARKER
        .captures_iter(text)
        .filter_map(|c| c[1].parse().ok())
        .collect()
}

/// Map 1-indexed citation markers to chunk ids, dropping out-of-range ones.
pub fn map_citations(markers: &[usize], passages: &[RetrievalResult]) -> Vec<String> {
    markers
        .iter()
        .filter_map(|&n| n.checked_sub(1).and_then(|i| passages.get(i)))
        .map(|p| p.chunk_id.clone())
        .collect()
}

/// Chunk ids cited by `text`, without duplicates.
pub fn cited_chunk_ids(text: &str, passages: &[RetrievalResult]) -> Vec<String> {
    let mut ids = map_citations(&extract_citation_markers(text), passages);
    let mut seen = std::collections::HashSet::new();
    ids.retain(|id| seen.insert(id.clone()));
    ids
}

/// Number the passages `[1] ...`, `[2] ...` for a prompt.
pub fn format_passages(passages: &[RetrievalResult]) -> String {
    if passages.is_empty() {
        return NO_PASSAGES.to_string();
    }
    passages
        .iter()
        .enumerate()
        .map(|(i, p)| format!("[{}] {}", i + 1, p.chunk_text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Split a response into `HEADER:` sections keyed by lowercase header.
///
/// Lines before the first header are dropped.
pub fn parse_sections(response: &str) -> BTreeMap<String, String> {
    let mut sections = BTreeMap::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in response.lines() {
        if let Some((head, rest)) = line.split_once(':') {
            let head = head.trim();
            if is_section_header(head) {
                if let Some((name, body)) = current.take() {
                    sections.insert(name, body.join("\n").trim().to_string());
                }
                let rest = rest.trim();
                let body = if rest.is_empty() { Vec::new() } else { vec![rest] };
                current = Some((head.to_lowercase(), body));
                continue;
            }
        }
        if let Some((_, body)) = current.as_mut() {
            body.push(line);
        }
    }
    if let Some((name, body)) = current {
        sections.insert(name, body.join("\n").trim().to_string());
    }
    sections
}

fn is_section_header(head: &str) -> bool {
    head.chars().any(|c| c.is_alphabetic())
        && !head.chars().any(|c| c.is_lowercase())
}

/// Trim, cap blank runs at one empty line, and strip trailing spaces.
pub fn clean_response(response: &str) -> String {
    let collapsed = EXCESS_NEWLINES.replace_all(response.trim(), "\n\n");
    collapsed
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}
