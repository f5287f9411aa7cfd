//! fc-token library
//!
//! Fetches FileCentipede activation codes, keeps them in an on-disk cache and
//! decides when to fetch again. The binary and the integration tests build on
//! these modules.

pub mod cache;
pub mod cli;
pub mod config;
pub mod data;
pub mod refresh;
pub mod scheduler;
pub mod time;
