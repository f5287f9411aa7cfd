//! Core data model for activation codes
//!
//! This module contains the `CodeEntry` value type plus the page parser and the
//! fetcher that produce entries from the remote activation code page.

pub mod fetcher;
pub mod parser;

pub use fetcher::{FetchError, FetchErrorKind, FetchedPage, Fetcher, ReqwestFetcher};
pub use parser::{parse_codes, ParseError};

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a candidate entry is rejected at construction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The code token is empty or whitespace
    #[error("activation code is empty")]
    EmptyCode,

    /// The window does not satisfy `valid_from < valid_until`
    #[error("validity window is empty or inverted: {valid_from} >= {valid_until}")]
    InvertedWindow {
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    },
}

/// An activation code together with its UTC validity window `[valid_from, valid_until)`
///
/// Entries are immutable; the cache only ever adds or removes whole entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawEntry")]
pub struct CodeEntry {
    code: String,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
}

/// Unchecked shape of an entry as it appears on disk
#[derive(Debug, Deserialize)]
struct RawEntry {
    code: String,
    valid_from: DateTime<Utc>,
    valid_until: DateTime<Utc>,
}

impl TryFrom<RawEntry> for CodeEntry {
    type Error = ValidationError;

    fn try_from(raw: RawEntry) -> Result<Self, Self::Error> {
        CodeEntry::new(raw.code, raw.valid_from, raw.valid_until)
    }
}

impl CodeEntry {
    /// Creates an entry, rejecting empty codes and empty or inverted windows
    ///
    /// Surrounding whitespace is trimmed from the code.
    pub fn new(
        code: impl Into<String>,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let code = code.into();
        let code = code.trim();
        if code.is_empty() {
            return Err(ValidationError::EmptyCode);
        }
        if valid_from >= valid_until {
            return Err(ValidationError::InvertedWindow {
                valid_from,
                valid_until,
            });
        }
        Ok(Self {
            code: code.to_string(),
            valid_from,
            valid_until,
        })
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn valid_from(&self) -> DateTime<Utc> {
        self.valid_from
    }

    pub fn valid_until(&self) -> DateTime<Utc> {
        self.valid_until
    }

    /// Whether the entry is valid at `now` (`valid_from <= now < valid_until`)
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.valid_from <= now && now < self.valid_until
    }

    /// Whether the window has fully elapsed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until <= now
    }

    /// Orders entries by start of validity, then by code so sorting is deterministic
    pub fn cmp_by_start(&self, other: &Self) -> Ordering {
        self.valid_from
            .cmp(&other.valid_from)
            .then_with(|| self.code.cmp(&other.code))
    }
}

impl fmt::Display for CodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} :: {}",
            self.valid_from.format("%Y-%m-%d %H:%M:%S"),
            self.valid_until.format("%Y-%m-%d %H:%M:%S"),
            self.code
        )
    }
}
