//! Activation code page parser
//!
//! The page lists codes in blocks of the form:
//!
//! ```text
//! 2024-01-01 00:00:00 - 2024-02-01 00:00:00
//! <one or more lines containing the activation code>
//! ```
//!
//! A code may wrap over several lines; everything up to the next date range is
//! concatenated and then cleaned down to the token itself.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use scraper::Html;
use thiserror::Error;
use tracing::debug;

use super::{CodeEntry, ValidationError};
use crate::time::parse_page_timestamp;

/// A date range line, the structural marker that introduces each code
static DATE_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\s*-\s*(\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})",
    )
    .expect("date range pattern is valid")
});

/// Codes use a URL-safe base64 alphabet and are at least 40 characters long
static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_-]{40,}").expect("token pattern is valid"));

/// Elements whose text is never page content
const SKIPPED_ELEMENTS: [&str; 3] = ["script", "style", "noscript"];

/// Errors that can occur when parsing the code page
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Date range markers were found but none of them yielded a usable entry,
    /// which means the page layout no longer matches what we expect
    #[error("page format not recognised: {markers} date range(s) found but no code could be extracted")]
    FormatDrift { markers: usize },
}

/// Why a single candidate block was dropped
#[derive(Debug, Error)]
enum SkipReason {
    #[error("unparseable timestamp '{0}'")]
    Timestamp(String),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Extracts the activation token from a noisy string
///
/// The page sometimes leaves trailing markup or script after the token. Returns
/// the first long run of token characters, or the trimmed input when there is none.
pub fn clean_token(raw: &str) -> &str {
    TOKEN
        .find(raw)
        .map(|m| m.as_str())
        .unwrap_or_else(|| raw.trim())
}

/// Parses activation code entries from raw page content
///
/// Entries are returned in the order they appear on the page. Malformed blocks are
/// skipped. Content without any date range yields an empty list; content with date
/// ranges that all fail to produce an entry is reported as [`ParseError::FormatDrift`].
pub fn parse_codes(content: &str, now: DateTime<Utc>) -> Result<Vec<CodeEntry>, ParseError> {
    let lines = page_lines(content);
    let mut entries = Vec::new();
    let mut markers = 0;

    let mut i = 0;
    while i < lines.len() {
        let Some(captures) = DATE_RANGE.captures(&lines[i]) else {
            i += 1;
            continue;
        };
        markers += 1;

        let mut raw_code = String::new();
        let mut k = i + 1;
        while k < lines.len() && !DATE_RANGE.is_match(&lines[k]) {
            raw_code.push_str(lines[k].trim());
            k += 1;
        }

        match build_entry(&captures[1], &captures[2], &raw_code) {
            Ok(entry) => entries.push(entry),
            Err(reason) => debug!(line = i, %reason, "skipping malformed code block"),
        }
        i = k;
    }

    if markers > 0 && entries.is_empty() {
        return Err(ParseError::FormatDrift { markers });
    }

    debug!(
        markers,
        parsed = entries.len(),
        expired = entries.iter().filter(|e| e.is_expired(now)).count(),
        "parsed code page"
    );
    Ok(entries)
}

fn build_entry(start: &str, end: &str, raw_code: &str) -> Result<CodeEntry, SkipReason> {
    let valid_from =
        parse_page_timestamp(start).ok_or_else(|| SkipReason::Timestamp(start.to_string()))?;
    let valid_until =
        parse_page_timestamp(end).ok_or_else(|| SkipReason::Timestamp(end.to_string()))?;
    Ok(CodeEntry::new(clean_token(raw_code), valid_from, valid_until)?)
}

/// Splits page content into text lines
///
/// Markup is reduced to its text nodes first so tags never end up inside a code.
fn page_lines(content: &str) -> Vec<String> {
    if !content.contains('<') {
        return content.lines().map(str::to_string).collect();
    }

    let document = Html::parse_document(content);
    let mut lines = Vec::new();
    for node in document.tree.root().descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .parent()
            .and_then(|parent| parent.value().as_element())
            .is_some_and(|element| SKIPPED_ELEMENTS.contains(&element.name()));
        if hidden {
            continue;
        }
        lines.extend(text.lines().map(str::to_string));
    }
    lines
}
