//! Persistent user settings
//!
//! Settings live in a small JSON file in the XDG config directory
//! (`~/.config/fc-token/settings.json` on Linux). A missing or unreadable file
//! falls back to defaults; the scheduler is always built from an explicit value.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::Duration;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::warn;

use crate::data::fetcher::DEFAULT_CODES_URL;
use crate::refresh::RefreshConfig;
use crate::scheduler::{RefreshMode, SchedulerConfig, MAX_INTERVAL_MINUTES, MIN_INTERVAL_MINUTES};

/// File name of the settings inside the config directory
pub const SETTINGS_FILE_NAME: &str = "settings.json";

const MAX_FETCH_TIMEOUT_SECS: u64 = 10 * 60;
const MAX_TICK_SECS: u64 = 60 * 60;

/// Errors that can occur when saving settings
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to encode settings: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write settings: {0}")]
    Io(#[from] io::Error),
}

/// User-adjustable settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Page the codes are fetched from
    pub url: String,
    /// Whether the background loop refreshes on its own
    pub auto_refresh: bool,
    pub mode: RefreshMode,
    /// Fixed-mode interval in minutes
    pub interval_minutes: i64,
    pub fetch_timeout_secs: u64,
    /// How often the background loop checks whether a refresh is due
    pub tick_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            url: DEFAULT_CODES_URL.to_string(),
            auto_refresh: true,
            mode: RefreshMode::Fixed,
            interval_minutes: 60,
            fetch_timeout_secs: 15,
            tick_secs: 30,
        }
    }
}

impl Settings {
    /// Returns the XDG-compliant settings file location
    pub fn default_path() -> Option<PathBuf> {
        let project_dirs = ProjectDirs::from("", "", "fc-token")?;
        Some(project_dirs.config_dir().join(SETTINGS_FILE_NAME))
    }

    /// Loads settings from `path`, falling back to defaults
    ///
    /// Unknown or missing fields take their default values. An unreadable file is
    /// reported with a warning and ignored.
    pub fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read settings, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_str::<Settings>(&content) {
            Ok(settings) => settings.normalized(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid settings file, using defaults");
                Self::default()
            }
        }
    }

    /// Writes settings to `path`, replacing the file atomically
    pub fn save(&self, path: &Path) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(self)?;
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Clamps values into their valid ranges
    fn normalized(mut self) -> Self {
        self.interval_minutes = self
            .interval_minutes
            .clamp(MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES);
        self.fetch_timeout_secs = self.fetch_timeout_secs.clamp(1, MAX_FETCH_TIMEOUT_SECS);
        self.tick_secs = self.tick_secs.clamp(1, MAX_TICK_SECS);
        self
    }

    /// Builds the scheduler configuration these settings describe
    ///
    /// Out-of-range values are clamped, so settings built in code behave like
    /// loaded ones.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let settings = self.clone().normalized();
        SchedulerConfig {
            url: settings.url,
            mode: settings.mode,
            interval: Duration::try_minutes(settings.interval_minutes)
                .unwrap_or_else(|| Duration::minutes(MAX_INTERVAL_MINUTES)),
            fetch_timeout: StdDuration::from_secs(settings.fetch_timeout_secs),
            ..SchedulerConfig::default()
        }
    }

    /// Builds the background loop configuration these settings describe
    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            tick_interval: StdDuration::from_secs(self.tick_secs.clamp(1, MAX_TICK_SECS)),
            enabled: self.auto_refresh,
        }
    }
}
