//! On-disk store of activation code entries
//!
//! Provides a `CodeCache` that keeps a de-duplicated, start-ordered set of
//! entries in memory and mirrors it to a JSON file. The file is only ever
//! replaced atomically, so a reader never sees a half-written cache.

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::data::CodeEntry;

/// File name of the cache inside the cache directory
pub const CACHE_FILE_NAME: &str = "codes.json";

/// Errors raised while persisting the cache
#[derive(Debug, Error)]
pub enum CacheError {
    /// Entries could not be serialized
    #[error("failed to encode cache: {0}")]
    Encode(#[from] serde_json::Error),

    /// The cache file could not be written or replaced
    #[error("failed to write cache file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

/// The cache file existed but could not be used; the cache starts empty instead
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cache file {path} is unreadable, starting empty: {reason}")]
pub struct CacheCorrupt {
    pub path: PathBuf,
    pub reason: String,
}

/// Layout written to disk
#[derive(Debug, Serialize)]
struct CacheFile<'a> {
    /// When the file was written
    saved_at: DateTime<Utc>,
    entries: &'a [CodeEntry],
}

/// Layouts accepted when reading
///
/// Entries are kept as raw JSON so a single bad entry can be dropped without
/// losing the rest of the file.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StoredCache {
    Wrapped {
        #[allow(dead_code)]
        saved_at: Option<DateTime<Utc>>,
        entries: Vec<serde_json::Value>,
    },
    Bare(Vec<serde_json::Value>),
}

/// Result of loading the cache at startup
#[derive(Debug)]
pub struct Loaded {
    pub cache: CodeCache,
    /// Set when the file existed but had to be discarded
    pub warning: Option<CacheCorrupt>,
}

/// Outcome of merging freshly parsed entries into the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    /// Whether the stored set differs from before the merge
    pub changed: bool,
    /// Number of new entries inserted
    pub added: usize,
    /// Number of previously stored entries removed as expired
    pub pruned: usize,
    /// Entry that was current before the merge
    pub previous_current: Option<CodeEntry>,
    /// Entry that is current after the merge
    pub new_current: Option<CodeEntry>,
}

impl MergeResult {
    /// Whether the merge changed which code is current
    pub fn current_changed(&self) -> bool {
        self.previous_current.as_ref().map(CodeEntry::code)
            != self.new_current.as_ref().map(CodeEntry::code)
    }
}

/// Persistent, time-ordered set of activation codes
///
/// Invariants: no two entries share a code, and entries are sorted by
/// `valid_from`. Expired entries are pruned strictly on every merge.
#[derive(Debug, Clone)]
pub struct CodeCache {
    /// Location of the JSON file
    path: PathBuf,
    entries: Vec<CodeEntry>,
}

impl CodeCache {
    /// Returns the XDG-compliant cache file location
    ///
    /// `~/.cache/fc-token/codes.json` on Linux. Returns `None` when no home
    /// directory can be determined.
    pub fn default_path() -> Option<PathBuf> {
        let project_dirs = ProjectDirs::from("", "", "fc-token")?;
        Some(project_dirs.cache_dir().join(CACHE_FILE_NAME))
    }

    /// Creates an empty cache backed by `path` without touching the filesystem
    pub fn empty(path: PathBuf) -> Self {
        Self {
            path,
            entries: Vec::new(),
        }
    }

    /// Loads the cache from `path`
    ///
    /// A missing file yields an empty cache. An unreadable or malformed file also
    /// yields an empty cache, with a [`CacheCorrupt`] warning attached. Individual
    /// invalid entries are skipped.
    pub fn load(path: PathBuf) -> Loaded {
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no cache file yet");
                return Loaded {
                    cache: Self::empty(path),
                    warning: None,
                };
            }
            Err(e) => return Self::corrupt(path, e.to_string()),
        };

        let raw_entries = match serde_json::from_str::<StoredCache>(&content) {
            Ok(StoredCache::Wrapped { entries, .. }) | Ok(StoredCache::Bare(entries)) => entries,
            Err(e) => return Self::corrupt(path, e.to_string()),
        };

        let mut entries: Vec<CodeEntry> = Vec::with_capacity(raw_entries.len());
        for raw in raw_entries {
            match serde_json::from_value::<CodeEntry>(raw) {
                Ok(entry) if entries.iter().any(|e| e.code() == entry.code()) => {
                    debug!(code = entry.code(), "dropping duplicate cached entry");
                }
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid cached entry"),
            }
        }
        entries.sort_by(CodeEntry::cmp_by_start);

        debug!(path = %path.display(), count = entries.len(), "loaded code cache");
        Loaded {
            cache: Self { path, entries },
            warning: None,
        }
    }

    fn corrupt(path: PathBuf, reason: String) -> Loaded {
        let warning = CacheCorrupt {
            path: path.clone(),
            reason,
        };
        warn!("{}", warning);
        Loaded {
            cache: Self::empty(path),
            warning: Some(warning),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All stored entries, ordered by `valid_from`
    pub fn entries(&self) -> &[CodeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry valid at `now`, if any
    ///
    /// A gap in coverage is a normal state and yields `None`.
    pub fn current(&self, now: DateTime<Utc>) -> Option<&CodeEntry> {
        self.entries.iter().find(|entry| entry.is_current(now))
    }

    /// Entries that are current or still to come at `now`, ordered by `valid_from`
    pub fn future(&self, now: DateTime<Utc>) -> Vec<CodeEntry> {
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .cloned()
            .collect()
    }

    /// Merges parsed entries into the cache and persists the result
    ///
    /// Entries whose code is already stored are ignored, entries already expired at
    /// `now` are dropped, and stored entries that have expired are pruned. The file
    /// is rewritten when the set changed or does not exist yet. If writing fails the
    /// in-memory set is left as it was.
    pub fn merge(
        &mut self,
        incoming: impl IntoIterator<Item = CodeEntry>,
        now: DateTime<Utc>,
    ) -> Result<MergeResult, CacheError> {
        let previous_current = self.current(now).cloned();

        let mut next: Vec<CodeEntry> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired(now))
            .cloned()
            .collect();
        let pruned = self.entries.len() - next.len();

        let mut added = 0;
        for entry in incoming {
            if entry.is_expired(now) || next.iter().any(|e| e.code() == entry.code()) {
                continue;
            }
            next.push(entry);
            added += 1;
        }
        next.sort_by(CodeEntry::cmp_by_start);

        let changed = added > 0 || pruned > 0;
        if changed || !self.path.exists() {
            self.persist(&next, now)?;
        }
        self.entries = next;

        Ok(MergeResult {
            changed,
            added,
            pruned,
            previous_current,
            new_current: self.current(now).cloned(),
        })
    }

    /// Removes every entry and persists the empty cache, stamped with `now`
    pub fn purge(&mut self, now: DateTime<Utc>) -> Result<(), CacheError> {
        self.persist(&[], now)?;
        self.entries.clear();
        Ok(())
    }

    /// Atomically replaces the cache file with `entries`
    fn persist(&self, entries: &[CodeEntry], now: DateTime<Utc>) -> Result<(), CacheError> {
        let json = serde_json::to_string_pretty(&CacheFile {
            saved_at: now,
            entries,
        })?;

        let write_err = |source: io::Error| CacheError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(write_err)?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        tmp.write_all(json.as_bytes()).map_err(write_err)?;
        tmp.flush().map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;

        debug!(path = %self.path.display(), count = entries.len(), "persisted code cache");
        Ok(())
    }
}
