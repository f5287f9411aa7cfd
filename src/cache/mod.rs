//! Cache module for storing activation codes on disk
//!
//! This module provides the code cache that persists parsed entries to the
//! filesystem, keeps them de-duplicated and ordered, prunes expired ones, and
//! answers which code is valid at a given instant.

mod store;

pub use store::{CacheCorrupt, CacheError, CodeCache, Loaded, MergeResult, CACHE_FILE_NAME};
