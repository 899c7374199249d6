//! Conversation history helpers: regex search, assistant-turn lookup and
//! scenario injection.

mod inject;

pub use inject::{inject_scenario, InjectOptions, SCENARIO_CLOSE, SCENARIO_OPEN};

use std::collections::BTreeMap;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, Role};

/// Assistant turns inspected by [`auto_find_ai_message_index`].
const AUTO_INDEX_WINDOW: usize = 5;
/// Minimum length (in characters) of a "substantial" assistant turn.
const AUTO_INDEX_MIN_CHARS: usize = 100;

const ELIDED_BEFORE: &str = "[earlier text omitted]...";
const ELIDED_AFTER: &str = "...[later text omitted]";

/// Which messages a history search looks at.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SearchScope {
    #[default]
    All,
    User,
    Assistant,
}

impl SearchScope {
    fn admits(self, role: Role) -> bool {
        match self {
            SearchScope::All => matches!(role, Role::User | Role::Assistant),
            SearchScope::User => role == Role::User,
            SearchScope::Assistant => role == Role::Assistant,
        }
    }
}

/// One search hit with surrounding context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub content: String,
    /// Lines between the hit and the end of the transcript.
    #[serde(rename = "loc")]
    pub lines_ago: usize,
}

/// Result of [`search_text`], returned to the model verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchReport {
    pub query: String,
    /// Total hits before the cap was applied.
    pub results_count: usize,
    pub results: Vec<SearchHit>,
    pub info: String,
}

/// Flatten messages to `role:content` blocks separated by blank lines.
pub fn messages_to_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}:{}", m.role.as_str(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Search the messages admitted by `scope`.
pub fn search_history(
    messages: &[ChatMessage],
    pattern: &str,
    scope: SearchScope,
    max_results: usize,
    context_chars: usize,
) -> SearchReport {
    let selected: Vec<ChatMessage> = messages
        .iter()
        .filter(|m| scope.admits(m.role))
        .cloned()
        .collect();
    search_text(pattern, &messages_to_text(&selected), max_results, context_chars)
}

/// Regex search over `text`, matching within sliding three-line windows so
/// a hit may span a line break but not whole paragraphs.
///
/// `.` matches newlines. Hits are deduplicated by start position and ordered
/// oldest first; at most `max_results` are returned. A bad pattern is
/// reported in `info` rather than as an error so the model can fix it.
pub fn search_text(
    pattern: &str,
    text: &str,
    max_results: usize,
    context_chars: usize,
) -> SearchReport {
    let mut report = SearchReport {
        query: pattern.to_string(),
        results_count: 0,
        results: Vec::new(),
        info: String::new(),
    };

    let regex = match RegexBuilder::new(pattern).dot_matches_new_line(true).build() {
        Ok(regex) => regex,
        Err(e) => {
            report.info = format!("[error] invalid pattern: {e}");
            return report;
        }
    };
    if text.is_empty() {
        report.info = "[warning] history is empty, nothing to search".into();
        return report;
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let mut line_offsets = Vec::with_capacity(lines.len());
    let mut offset = 0;
    for line in &lines {
        line_offsets.push(offset);
        offset += line.len() + 1;
    }

    // start -> (end, line of start). A start seen by an earlier window keeps
    // that window's end.
    let mut hits: BTreeMap<usize, (usize, usize)> = BTreeMap::new();
    for idx in 0..lines.len() {
        let first = idx.saturating_sub(1);
        let last = (idx + 2).min(lines.len());
        let window = lines[first..last].join("\n");
        let base = line_offsets[first];
        for m in regex.find_iter(&window) {
            let start = base + m.start();
            let end = base + m.end();
            hits.entry(start)
                .or_insert_with(|| (end, text[..start].matches('\n').count()));
        }
    }

    report.results_count = hits.len();
    report.results = hits
        .iter()
        .take(max_results)
        .map(|(&start, &(end, line))| SearchHit {
            content: context_around(text, start, end, context_chars),
            lines_ago: lines.len() - line - 1,
        })
        .collect();
    report.info = if hits.len() > max_results {
        "[warning] too many matches, refine the pattern".into()
    } else {
        format!("[info] {} matches", hits.len())
    };
    report
}

fn context_around(text: &str, start: usize, end: usize, context_chars: usize) -> String {
    let from = text[..start]
        .char_indices()
        .rev()
        .take(context_chars)
        .last()
        .map_or(start, |(i, _)| i);
    let to = text[end..]
        .char_indices()
        .nth(context_chars)
        .map_or(text.len(), |(i, _)| end + i);

    let mut out = String::new();
    if from > 0 {
        out.push_str(ELIDED_BEFORE);
    }
    out.push_str(&text[from..to]);
    if to < text.len() {
        out.push_str(ELIDED_AFTER);
    }
    out
}

/// The `offset`-th newest assistant message (0 = newest).
pub fn extract_latest_ai_message(messages: &[ChatMessage], offset: usize) -> Option<&str> {
    messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .nth(offset)
        .map(|m| m.content.as_str())
}

/// Offset of the newest substantial assistant message among the last few.
///
/// Front-ends that append short status turns after the real reply would
/// otherwise make the workflow read the status turn. Falls back to 0.
pub fn auto_find_ai_message_index(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .take(AUTO_INDEX_WINDOW)
        .position(|m| m.content.chars().count() > AUTO_INDEX_MIN_CHARS)
        .unwrap_or(0)
}
