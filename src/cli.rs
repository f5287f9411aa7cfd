//! Command-line interface parsing for fc-token
//!
//! This module handles parsing of CLI arguments using clap: global overrides for
//! the page URL and file locations, plus one subcommand per core operation.

use std::path::PathBuf;

use chrono::Duration;
use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::scheduler::{RefreshMode, MAX_INTERVAL_MINUTES, MIN_INTERVAL_MINUTES};

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// The specified refresh mode is not recognized
    #[error("Invalid mode: '{0}'. Valid modes: auto, fixed")]
    InvalidMode(String),

    /// The interval is not a whole number of minutes within the accepted range
    #[error("Invalid interval: '{0}'. Expected a whole number of minutes between 1 and 525600")]
    InvalidInterval(String),
}

/// fc-token - Keep the currently valid FileCentipede activation code at hand
#[derive(Parser, Debug)]
#[command(name = "fc-token")]
#[command(about = "Fetch, cache and schedule FileCentipede activation codes")]
#[command(version)]
pub struct Cli {
    /// Fetch codes from this page instead of the configured one
    #[arg(long, global = true, value_name = "URL")]
    pub url: Option<String>,

    /// Use this cache file instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    pub cache_file: Option<PathBuf>,

    /// Use this settings file instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Log debug details to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the code valid right now, refreshing once if none is cached
    Current,
    /// List the current and upcoming codes in local time
    Future,
    /// Fetch the page now and report what was found
    Refresh,
    /// Remove every cached code
    Purge,
    /// Change how refreshes are scheduled
    ///
    /// Examples:
    ///   fc-token mode auto                # Follow the validity windows
    ///   fc-token mode fixed --interval 30 # Refresh every 30 minutes
    Mode {
        /// Scheduling mode: auto or fixed
        #[arg(value_name = "MODE")]
        mode: String,

        /// Fixed-mode interval in minutes
        #[arg(long, value_name = "MINUTES")]
        interval: Option<String>,
    },
    /// Keep refreshing in the foreground and print code changes until Ctrl-C
    Watch,
}

impl Cli {
    /// The subcommand to run; `current` when none is given
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Current)
    }
}

/// Parses a mode string argument into a RefreshMode.
///
/// # Arguments
/// * `s` - The mode string from CLI
///
/// # Returns
/// * `Ok(RefreshMode)` if the string names a known mode
/// * `Err(CliError::InvalidMode)` if it doesn't
pub fn parse_mode_arg(s: &str) -> Result<RefreshMode, CliError> {
    s.parse().map_err(|_| CliError::InvalidMode(s.to_string()))
}

/// Parses an interval in whole minutes.
///
/// # Returns
/// * `Ok(Duration)` for one minute up to one year
/// * `Err(CliError::InvalidInterval)` for anything else
pub fn parse_interval_arg(s: &str) -> Result<Duration, CliError> {
    s.trim()
        .parse::<i64>()
        .ok()
        .filter(|minutes| (MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(minutes))
        .and_then(Duration::try_minutes)
        .ok_or_else(|| CliError::InvalidInterval(s.to_string()))
}
