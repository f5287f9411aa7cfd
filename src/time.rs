//! Clock and timestamp helpers
//!
//! Everything the core stores or compares is UTC. Conversion to local time only
//! happens at the presentation edge (see [`format_local`]).

use std::sync::Mutex;

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone, Utc};

/// Timestamp layout used by the activation code page
pub const PAGE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Source of "now" for the scheduler and cache
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
///
/// Used by tests and by callers that need to replay a schedule deterministically.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Parses a page timestamp (`2024-01-01 00:00:00`) as a UTC instant
///
/// The page publishes absolute timestamps without an offset; they are UTC.
pub fn parse_page_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), PAGE_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Renders a UTC instant in the local timezone for display
pub fn format_local(instant: DateTime<Utc>) -> String {
    instant
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M %Z")
        .to_string()
}

/// Short human form of a duration: `45s`, `12m`, `3h`, `1d 4h`
///
/// Minutes are only shown when there is no larger unit. Negative durations
/// render as `0s`.
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.num_seconds().max(0);
    if seconds < 60 {
        return format!("{}s", seconds);
    }

    let minutes = seconds / 60;
    let days = minutes / (24 * 60);
    let hours = (minutes / 60) % 24;
    let mins = minutes % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if mins > 0 && parts.is_empty() {
        parts.push(format!("{}m", mins));
    }
    if parts.is_empty() {
        return "0m".to_string();
    }
    parts.join(" ")
}
