//! Refresh scheduling for the activation code cache
//!
//! The scheduler owns the code cache and decides when the page should be fetched
//! again. Two policies are supported:
//!
//! - `Fixed`: fetch every `interval`, measured from the last fetch.
//! - `Auto`: fetch right after the current code expires, so the replacement is
//!   picked up as soon as it matters. Falls back to a long default interval when
//!   nothing ahead is known.
//!
//! Refreshes are single-flight: callers arriving while a cycle is running wait for
//! it and share its outcome instead of starting a second fetch.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, CodeCache, MergeResult};
use crate::data::{parse_codes, CodeEntry, FetchError, FetchErrorKind, Fetcher, ParseError};
use crate::time::{format_duration, Clock};

/// Shortest interval accepted in fixed mode
pub const MIN_INTERVAL_MINUTES: i64 = 1;

/// Longest interval accepted in fixed mode (one year)
pub const MAX_INTERVAL_MINUTES: i64 = 365 * 24 * 60;

/// Scheduling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshMode {
    /// Fetch on a constant interval
    Fixed,
    /// Fetch when the current code expires
    Auto,
}

impl fmt::Display for RefreshMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshMode::Fixed => write!(f, "fixed"),
            RefreshMode::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for RefreshMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fixed" | "interval" | "manual" => Ok(RefreshMode::Fixed),
            "auto" | "automatic" => Ok(RefreshMode::Auto),
            other => Err(other.to_string()),
        }
    }
}

/// Configuration for the scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Page the codes are fetched from
    pub url: String,
    pub mode: RefreshMode,
    /// Interval used in fixed mode
    pub interval: Duration,
    /// Upper bound on a single fetch
    pub fetch_timeout: StdDuration,
    /// Delay after the current code expires before fetching in auto mode
    pub auto_grace: Duration,
    /// Interval used in auto mode when no current or upcoming code is known
    pub auto_fallback: Duration,
    /// First retry delay after a failed refresh; doubles per consecutive failure
    pub retry_base: Duration,
    /// Longest retry delay
    pub retry_max: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            url: crate::data::fetcher::DEFAULT_CODES_URL.to_string(),
            mode: RefreshMode::Fixed,
            interval: Duration::minutes(60),
            fetch_timeout: StdDuration::from_secs(15),
            auto_grace: Duration::minutes(1),
            auto_fallback: Duration::hours(24),
            retry_base: Duration::minutes(5),
            retry_max: Duration::hours(6),
        }
    }
}

/// Why a refresh cycle failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("failed to store codes: {0}")]
    Storage(String),
}

impl From<CacheError> for RefreshError {
    fn from(err: CacheError) -> Self {
        RefreshError::Storage(err.to_string())
    }
}

/// What a successful fetch looked like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeStats {
    /// Browser identity the request was sent as
    pub identity: String,
    /// Response body size in bytes
    pub bytes: usize,
    /// Number of entries parsed from the page
    pub parsed: usize,
}

/// Result of one refresh cycle, as reported to callers
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub success: bool,
    pub error: Option<RefreshError>,
    /// True when this caller joined a cycle started by someone else
    pub coalesced: bool,
    pub merge: Option<MergeResult>,
    pub stats: Option<ScrapeStats>,
    pub finished_at: DateTime<Utc>,
}

/// Fired when the code that is current changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeChanged {
    pub previous: Option<CodeEntry>,
    pub current: Option<CodeEntry>,
}

/// Read-only view of the scheduler state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub mode: RefreshMode,
    pub interval: Duration,
    pub next_due: DateTime<Utc>,
    pub last_fetch: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct SchedulerState {
    mode: RefreshMode,
    interval: Duration,
    next_due: DateTime<Utc>,
    last_fetch: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_outcome: Option<RefreshOutcome>,
    /// Current entry as last announced to subscribers
    announced: Option<CodeEntry>,
}

/// Owns the code cache and drives fetch, parse and merge cycles
pub struct Scheduler {
    config: SchedulerConfig,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    cache: RwLock<CodeCache>,
    state: Mutex<SchedulerState>,
    /// Held for the duration of a refresh cycle
    flight: tokio::sync::Mutex<()>,
    /// Number of finished cycles, used by waiters to detect a cycle they can join
    completed: AtomicU64,
    events: broadcast::Sender<CodeChanged>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Creates a scheduler over an already loaded cache
    ///
    /// The first refresh is due immediately.
    pub fn new(
        config: SchedulerConfig,
        cache: CodeCache,
        fetcher: Arc<dyn Fetcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        let (events, _) = broadcast::channel(16);
        let state = SchedulerState {
            mode: config.mode,
            interval: clamp_interval(config.interval),
            next_due: now,
            last_fetch: None,
            consecutive_failures: 0,
            last_outcome: None,
            announced: cache.current(now).cloned(),
        };

        Self {
            config,
            fetcher,
            clock,
            cache: RwLock::new(cache),
            state: Mutex::new(state),
            flight: tokio::sync::Mutex::new(()),
            completed: AtomicU64::new(0),
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `token` to abort in-flight fetches on shutdown
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current time according to the scheduler's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Subscribes to code change events
    pub fn subscribe(&self) -> broadcast::Receiver<CodeChanged> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.lock_state();
        SchedulerSnapshot {
            mode: state.mode,
            interval: state.interval,
            next_due: state.next_due,
            last_fetch: state.last_fetch,
            consecutive_failures: state.consecutive_failures,
        }
    }

    pub fn next_due(&self) -> DateTime<Utc> {
        self.lock_state().next_due
    }

    /// The code valid at `now`, if the cache covers it
    pub fn current(&self, now: DateTime<Utc>) -> Option<CodeEntry> {
        self.read_cache().current(now).cloned()
    }

    /// Current and upcoming codes, ordered by start of validity
    pub fn future(&self, now: DateTime<Utc>) -> Vec<CodeEntry> {
        self.read_cache().future(now)
    }

    /// Changes the scheduling policy and recomputes the next due time
    ///
    /// `interval` only replaces the fixed interval when given; it is clamped to at
    /// least one minute.
    pub fn set_mode(&self, mode: RefreshMode, interval: Option<Duration>) -> DateTime<Utc> {
        let now = self.clock.now();
        let cache = self.read_cache();
        let mut state = self.lock_state();

        state.mode = mode;
        if let Some(interval) = interval {
            state.interval = clamp_interval(interval);
        }
        state.next_due = self.scheduled_due(&state, &cache, now);

        info!(
            %mode,
            interval = %format_duration(state.interval),
            next_due = %state.next_due,
            "refresh schedule updated"
        );
        state.next_due
    }

    /// Runs one fetch, parse and merge cycle now
    ///
    /// If a cycle is already running, waits for it and returns its outcome with
    /// `coalesced` set instead of fetching again. Failures are reported in the
    /// outcome, never as a panic or error to the caller.
    pub async fn refresh_now(&self) -> RefreshOutcome {
        let observed = self.completed.load(Ordering::Acquire);
        let _flight = self.flight.lock().await;

        if self.completed.load(Ordering::Acquire) != observed {
            let joined = self.lock_state().last_outcome.clone();
            if let Some(outcome) = joined {
                debug!("joined refresh that finished while waiting");
                return RefreshOutcome {
                    coalesced: true,
                    ..outcome
                };
            }
        }

        let outcome = self.run_cycle().await;
        self.completed.fetch_add(1, Ordering::Release);
        outcome
    }

    /// Called periodically by the host loop
    ///
    /// Announces a code rollover if time has moved past the announced code, then
    /// refreshes when `now` has reached the due time.
    pub async fn on_tick(&self, now: DateTime<Utc>) -> Option<RefreshOutcome> {
        self.announce_if_changed(now);
        if now < self.next_due() {
            return None;
        }
        Some(self.refresh_now().await)
    }

    /// Clears the cache, waiting for any in-flight refresh first
    pub async fn purge(&self) -> Result<(), CacheError> {
        let _flight = self.flight.lock().await;
        let now = self.clock.now();
        self.write_cache().purge(now)?;

        {
            let cache = self.read_cache();
            let mut state = self.lock_state();
            state.next_due = self.scheduled_due(&state, &cache, now);
        }
        info!("code cache purged");
        self.announce_if_changed(now);
        Ok(())
    }

    async fn run_cycle(&self) -> RefreshOutcome {
        let started = self.clock.now();
        info!(url = %self.config.url, "refreshing activation codes");

        let result = self.fetch_and_merge().await;
        let finished_at = self.clock.now();

        let outcome = {
            let cache = self.read_cache();
            let mut state = self.lock_state();
            state.last_fetch = Some(started);

            let outcome = match result {
                Ok((stats, merge)) => {
                    state.consecutive_failures = 0;
                    state.next_due = self.scheduled_due(&state, &cache, finished_at);
                    info!(
                        identity = %stats.identity,
                        bytes = stats.bytes,
                        parsed = stats.parsed,
                        added = merge.added,
                        pruned = merge.pruned,
                        next_due = %state.next_due,
                        "refresh complete"
                    );
                    RefreshOutcome {
                        success: true,
                        error: None,
                        coalesced: false,
                        merge: Some(merge),
                        stats: Some(stats),
                        finished_at,
                    }
                }
                Err(error) => {
                    state.consecutive_failures += 1;
                    let delay = self.backoff(&state);
                    state.next_due = add_saturating(finished_at, delay);
                    warn!(
                        %error,
                        failures = state.consecutive_failures,
                        retry_in = %format_duration(delay),
                        "refresh failed"
                    );
                    RefreshOutcome {
                        success: false,
                        error: Some(error),
                        coalesced: false,
                        merge: None,
                        stats: None,
                        finished_at,
                    }
                }
            };
            state.last_outcome = Some(outcome.clone());
            outcome
        };

        self.announce_if_changed(finished_at);
        outcome
    }

    async fn fetch_and_merge(&self) -> Result<(ScrapeStats, MergeResult), RefreshError> {
        let timeout = self.config.fetch_timeout;
        let page = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(FetchError::new(FetchErrorKind::Cancelled, "shutdown requested"))
            }
            result = tokio::time::timeout(timeout, self.fetcher.fetch(&self.config.url, timeout)) => {
                result.unwrap_or_else(|_| {
                    Err(FetchError::new(
                        FetchErrorKind::Timeout,
                        format!("no response within {}s", timeout.as_secs_f32()),
                    ))
                })
            }
        }?;

        let now = self.clock.now();
        let entries = parse_codes(&page.body, now)?;
        let stats = ScrapeStats {
            identity: page.identity,
            bytes: page.bytes,
            parsed: entries.len(),
        };
        let merge = self.write_cache().merge(entries, now)?;
        Ok((stats, merge))
    }

    /// Due time after a successful cycle or a policy change
    fn scheduled_due(
        &self,
        state: &SchedulerState,
        cache: &CodeCache,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        match state.mode {
            RefreshMode::Fixed => state
                .last_fetch
                .map(|last| add_saturating(last, state.interval))
                .unwrap_or(now),
            RefreshMode::Auto => self.auto_due(cache, now),
        }
    }

    fn auto_due(&self, cache: &CodeCache, now: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(current) = cache.current(now) {
            return add_saturating(current.valid_until(), self.config.auto_grace);
        }

        let fallback = add_saturating(now, self.config.auto_fallback);
        match cache.future(now).first() {
            Some(upcoming) => fallback.min(add_saturating(upcoming.valid_from(), self.config.auto_grace)),
            None => fallback,
        }
    }

    /// Retry delay after `consecutive_failures` failed cycles
    fn backoff(&self, state: &SchedulerState) -> Duration {
        let exponent = state.consecutive_failures.saturating_sub(1).min(16);
        let delay = self
            .config
            .retry_base
            .checked_mul(1i32 << exponent)
            .map_or(self.config.retry_max, |delay| delay.min(self.config.retry_max));
        match state.mode {
            RefreshMode::Fixed => delay.min(state.interval),
            RefreshMode::Auto => delay,
        }
    }

    fn announce_if_changed(&self, now: DateTime<Utc>) {
        let current = self.read_cache().current(now).cloned();
        let event = {
            let mut state = self.lock_state();
            let unchanged = state.announced.as_ref().map(CodeEntry::code)
                == current.as_ref().map(CodeEntry::code);
            if unchanged {
                return;
            }
            let previous = std::mem::replace(&mut state.announced, current.clone());
            CodeChanged { previous, current }
        };

        info!(
            previous = event.previous.as_ref().map(CodeEntry::code),
            current = event.current.as_ref().map(CodeEntry::code),
            "current activation code changed"
        );
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, CodeCache> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, CodeCache> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(
        Duration::minutes(MIN_INTERVAL_MINUTES),
        Duration::minutes(MAX_INTERVAL_MINUTES),
    )
}

/// `instant + delta`, pinned to the latest representable instant on overflow
fn add_saturating(instant: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    instant
        .checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CACHE_FILE_NAME;
    use crate::data::FetchedPage;
    use crate::time::ManualClock;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    const PAGE: &str = "2024-01-01 00:00:00 - 2024-01-02 00:00:00\nCODE_ONE\n\
                        2024-01-02 00:00:00 - 2024-01-03 00:00:00\nCODE_TWO\n";

    /// Fetcher that returns a configurable response after an optional delay
    struct ScriptedFetcher {
        calls: AtomicUsize,
        delay: StdDuration,
        response: Mutex<Result<String, FetchError>>,
    }

    impl ScriptedFetcher {
        fn new(body: &str) -> Arc<Self> {
            Self::with_delay(body, StdDuration::ZERO)
        }

        fn with_delay(body: &str, delay: StdDuration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                response: Mutex::new(Ok(body.to_string())),
            })
        }

        fn fail_with(&self, err: FetchError) {
            *self.response.lock().unwrap() = Err(err);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, _url: &str, _timeout: StdDuration) -> Result<FetchedPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let body = self.response.lock().unwrap().clone()?;
            Ok(FetchedPage {
                bytes: body.len(),
                body,
                identity: "Test".to_string(),
            })
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    struct Harness {
        scheduler: Arc<Scheduler>,
        fetcher: Arc<ScriptedFetcher>,
        clock: Arc<ManualClock>,
        _dir: TempDir,
    }

    fn harness(config: SchedulerConfig, fetcher: Arc<ScriptedFetcher>, now: DateTime<Utc>) -> Harness {
        let dir = TempDir::new().unwrap();
        let cache = CodeCache::load(dir.path().join(CACHE_FILE_NAME)).cache;
        let clock = Arc::new(ManualClock::new(now));
        let scheduler = Scheduler::new(config, cache, fetcher.clone(), clock.clone());
        Harness {
            scheduler: Arc::new(scheduler),
            fetcher,
            clock,
            _dir: dir,
        }
    }

    #[test]
    fn test_refresh_mode_from_str() {
        assert_eq!("auto".parse::<RefreshMode>(), Ok(RefreshMode::Auto));
        assert_eq!("FIXED".parse::<RefreshMode>(), Ok(RefreshMode::Fixed));
        assert!("sometimes".parse::<RefreshMode>().is_err());
    }

    #[test]
    fn test_first_refresh_is_due_immediately() {
        let h = harness(SchedulerConfig::default(), ScriptedFetcher::new(PAGE), at(1, 12));
        assert_eq!(h.scheduler.next_due(), at(1, 12));
    }

    #[tokio::test]
    async fn test_refresh_populates_cache() {
        let h = harness(SchedulerConfig::default(), ScriptedFetcher::new(PAGE), at(1, 12));

        let outcome = h.scheduler.refresh_now().await;

        assert!(outcome.success);
        assert!(!outcome.coalesced);
        let stats = outcome.stats.unwrap();
        assert_eq!(stats.parsed, 2);
        assert_eq!(stats.identity, "Test");
        assert_eq!(
            h.scheduler.current(at(1, 12)).map(|e| e.code().to_string()),
            Some("CODE_ONE".to_string())
        );
        assert_eq!(h.scheduler.future(at(1, 12)).len(), 2);
    }

    #[tokio::test]
    async fn test_fixed_mode_schedules_interval_after_fetch() {
        let config = SchedulerConfig {
            interval: Duration::minutes(90),
            ..Default::default()
        };
        let h = harness(config, ScriptedFetcher::new(PAGE), at(1, 12));

        h.scheduler.refresh_now().await;

        assert_eq!(h.scheduler.next_due(), at(1, 12) + Duration::minutes(90));
    }

    #[tokio::test]
    async fn test_auto_mode_schedules_after_current_expiry() {
        let config = SchedulerConfig {
            mode: RefreshMode::Auto,
            ..Default::default()
        };
        let grace = config.auto_grace;
        let h = harness(config, ScriptedFetcher::new(PAGE), at(1, 12));

        h.scheduler.refresh_now().await;

        // CODE_ONE expires at 2024-01-02T00:00Z.
        let due = h.scheduler.next_due();
        assert!(due >= at(2, 0));
        assert!(due <= at(2, 0) + grace);
    }

    #[tokio::test]
    async fn test_auto_mode_without_codes_uses_fallback() {
        let config = SchedulerConfig {
            mode: RefreshMode::Auto,
            ..Default::default()
        };
        let fallback = config.auto_fallback;
        let h = harness(config, ScriptedFetcher::new("nothing published"), at(1, 12));

        let outcome = h.scheduler.refresh_now().await;

        assert!(outcome.success);
        assert_eq!(h.scheduler.next_due(), at(1, 12) + fallback);
    }

    #[tokio::test]
    async fn test_auto_mode_gap_waits_for_upcoming_code() {
        let page = "2024-01-01 18:00:00 - 2024-01-02 00:00:00\nLATER\n";
        let config = SchedulerConfig {
            mode: RefreshMode::Auto,
            ..Default::default()
        };
        let grace = config.auto_grace;
        let h = harness(config, ScriptedFetcher::new(page), at(1, 12));

        h.scheduler.refresh_now().await;

        assert_eq!(h.scheduler.current(at(1, 12)), None);
        assert_eq!(h.scheduler.next_due(), at(1, 18) + grace);
    }

    #[tokio::test]
    async fn test_set_mode_recomputes_from_cache() {
        let h = harness(SchedulerConfig::default(), ScriptedFetcher::new(PAGE), at(1, 12));
        h.scheduler.refresh_now().await;

        let due = h.scheduler.set_mode(RefreshMode::Auto, None);
        assert_eq!(due, at(2, 0) + h.scheduler.config().auto_grace);
        assert_eq!(h.scheduler.snapshot().mode, RefreshMode::Auto);

        let due = h.scheduler.set_mode(RefreshMode::Fixed, Some(Duration::minutes(30)));
        assert_eq!(due, at(1, 12) + Duration::minutes(30));
    }

    #[test]
    fn test_set_mode_clamps_interval() {
        let h = harness(SchedulerConfig::default(), ScriptedFetcher::new(PAGE), at(1, 12));

        h.scheduler.set_mode(RefreshMode::Fixed, Some(Duration::seconds(5)));

        assert_eq!(h.scheduler.snapshot().interval, Duration::minutes(1));
    }

    #[tokio::test]
    async fn test_oversized_interval_is_capped() {
        let config = SchedulerConfig {
            interval: Duration::MAX,
            ..Default::default()
        };
        let h = harness(config, ScriptedFetcher::new(PAGE), at(1, 12));
        assert_eq!(
            h.scheduler.snapshot().interval,
            Duration::minutes(MAX_INTERVAL_MINUTES)
        );

        h.scheduler.set_mode(RefreshMode::Fixed, Some(Duration::MAX));
        assert!(h.scheduler.refresh_now().await.success);

        assert_eq!(
            h.scheduler.next_due(),
            at(1, 12) + Duration::minutes(MAX_INTERVAL_MINUTES)
        );
    }

    #[test]
    fn test_add_saturating() {
        assert_eq!(add_saturating(at(1, 12), Duration::hours(1)), at(1, 13));
        assert_eq!(
            add_saturating(at(1, 12), Duration::MAX),
            DateTime::<Utc>::MAX_UTC
        );
    }

    #[tokio::test]
    async fn test_retry_time_saturates_at_end_of_time() {
        let late = DateTime::<Utc>::MAX_UTC - Duration::minutes(10);
        let h = harness(SchedulerConfig::default(), ScriptedFetcher::new(PAGE), late);

        h.fetcher
            .fail_with(FetchError::new(FetchErrorKind::Network, "connection reset"));
        for _ in 0..20 {
            h.scheduler.refresh_now().await;
        }
        assert_eq!(h.scheduler.next_due(), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_huge_retry_base_falls_back_to_retry_max() {
        let config = SchedulerConfig {
            mode: RefreshMode::Auto,
            retry_base: Duration::MAX,
            ..Default::default()
        };
        let retry_max = config.retry_max;
        let h = harness(config, ScriptedFetcher::new(PAGE), at(1, 12));
        h.fetcher
            .fail_with(FetchError::new(FetchErrorKind::Network, "connection reset"));

        h.scheduler.refresh_now().await;
        h.scheduler.refresh_now().await;

        assert_eq!(h.scheduler.next_due(), at(1, 12) + retry_max);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_share_one_fetch() {
        let fetcher = ScriptedFetcher::with_delay(PAGE, StdDuration::from_millis(200));
        let h = harness(SchedulerConfig::default(), fetcher, at(1, 12));

        let outcomes = futures::future::join_all((0..3).map(|_| {
            let scheduler = h.scheduler.clone();
            async move { scheduler.refresh_now().await }
        }))
        .await;

        assert_eq!(h.fetcher.calls(), 1);
        assert!(outcomes.iter().all(|o| o.success));
        assert_eq!(outcomes.iter().filter(|o| !o.coalesced).count(), 1);
    }

    #[tokio::test]
    async fn test_sequential_refreshes_each_fetch() {
        let h = harness(SchedulerConfig::default(), ScriptedFetcher::new(PAGE), at(1, 12));

        h.scheduler.refresh_now().await;
        let second = h.scheduler.refresh_now().await;

        assert_eq!(h.fetcher.calls(), 2);
        assert!(!second.coalesced);
    }

    #[tokio::test]
    async fn test_fetch_failure_backs_off() {
        let config = SchedulerConfig {
            mode: RefreshMode::Auto,
            ..Default::default()
        };
        let retry_base = config.retry_base;
        let h = harness(config, ScriptedFetcher::new(PAGE), at(1, 12));
        h.fetcher
            .fail_with(FetchError::new(FetchErrorKind::HttpStatus(503), "unavailable"));

        let first = h.scheduler.refresh_now().await;
        assert!(!first.success);
        assert!(matches!(
            first.error,
            Some(RefreshError::Fetch(FetchError {
                kind: FetchErrorKind::HttpStatus(503),
                ..
            }))
        ));
        assert_eq!(h.scheduler.next_due(), at(1, 12) + retry_base);

        h.scheduler.refresh_now().await;
        assert_eq!(h.scheduler.next_due(), at(1, 12) + retry_base * 2);
        assert_eq!(h.scheduler.snapshot().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_backoff_is_bounded_by_fixed_interval() {
        let config = SchedulerConfig {
            interval: Duration::minutes(2),
            ..Default::default()
        };
        let h = harness(config, ScriptedFetcher::new(PAGE), at(1, 12));
        h.fetcher
            .fail_with(FetchError::new(FetchErrorKind::Network, "connection reset"));

        for _ in 0..4 {
            h.scheduler.refresh_now().await;
        }

        assert_eq!(h.scheduler.next_due(), at(1, 12) + Duration::minutes(2));
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let h = harness(SchedulerConfig::default(), ScriptedFetcher::new(PAGE), at(1, 12));
        h.fetcher
            .fail_with(FetchError::new(FetchErrorKind::Network, "connection reset"));
        h.scheduler.refresh_now().await;

        *h.fetcher.response.lock().unwrap() = Ok(PAGE.to_string());
        let outcome = h.scheduler.refresh_now().await;

        assert!(outcome.success);
        assert_eq!(h.scheduler.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_parse_failure_is_reported_not_fatal() {
        let page = "2024-01-01 00:00:00 - 2024-01-02 00:00:00\n";
        let h = harness(SchedulerConfig::default(), ScriptedFetcher::new(page), at(1, 12));

        let outcome = h.scheduler.refresh_now().await;

        assert!(!outcome.success);
        assert_eq!(
            outcome.error,
            Some(RefreshError::Parse(ParseError::FormatDrift { markers: 1 }))
        );
        assert!(h.scheduler.next_due() > at(1, 12));
    }

    #[tokio::test]
    async fn test_slow_fetch_times_out() {
        let config = SchedulerConfig {
            fetch_timeout: StdDuration::from_millis(50),
            ..Default::default()
        };
        let fetcher = ScriptedFetcher::with_delay(PAGE, StdDuration::from_secs(5));
        let h = harness(config, fetcher, at(1, 12));

        let outcome = h.scheduler.refresh_now().await;

        assert!(matches!(
            outcome.error,
            Some(RefreshError::Fetch(FetchError {
                kind: FetchErrorKind::Timeout,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_fetch_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let cache = CodeCache::load(dir.path().join(CACHE_FILE_NAME)).cache;
        let token = CancellationToken::new();
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            cache,
            ScriptedFetcher::with_delay(PAGE, StdDuration::from_secs(5)),
            Arc::new(ManualClock::new(at(1, 12))),
        )
        .with_cancellation(token.clone());

        token.cancel();
        let outcome = scheduler.refresh_now().await;

        assert!(!outcome.success);
        assert!(matches!(
            outcome.error,
            Some(RefreshError::Fetch(FetchError {
                kind: FetchErrorKind::Cancelled,
                ..
            }))
        ));
        assert!(scheduler.next_due() > at(1, 12));
    }

    #[tokio::test]
    async fn test_on_tick_only_refreshes_when_due() {
        let config = SchedulerConfig {
            interval: Duration::minutes(60),
            ..Default::default()
        };
        let h = harness(config, ScriptedFetcher::new(PAGE), at(1, 12));

        assert!(h.scheduler.on_tick(at(1, 12)).await.is_some());
        assert!(h.scheduler.on_tick(at(1, 12) + Duration::minutes(30)).await.is_none());
        assert_eq!(h.fetcher.calls(), 1);

        h.clock.set(at(1, 13));
        assert!(h.scheduler.on_tick(at(1, 13)).await.is_some());
        assert_eq!(h.fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_code_change_event_on_first_fill_only() {
        let h = harness(SchedulerConfig::default(), ScriptedFetcher::new(PAGE), at(1, 12));
        let mut events = h.scheduler.subscribe();

        h.scheduler.refresh_now().await;
        let event = events.try_recv().unwrap();
        assert_eq!(event.previous, None);
        assert_eq!(event.current.unwrap().code(), "CODE_ONE");

        h.scheduler.refresh_now().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_code_rollover_is_announced_on_tick() {
        let config = SchedulerConfig {
            interval: Duration::hours(48),
            ..Default::default()
        };
        let h = harness(config, ScriptedFetcher::new(PAGE), at(1, 12));
        h.scheduler.refresh_now().await;
        let mut events = h.scheduler.subscribe();

        assert!(h.scheduler.on_tick(at(1, 18)).await.is_none());
        assert!(events.try_recv().is_err());

        // Not due yet in fixed mode, but CODE_ONE has expired.
        assert!(h.scheduler.on_tick(at(2, 0)).await.is_none());
        assert_eq!(h.fetcher.calls(), 1);

        let event = events.try_recv().unwrap();
        assert_eq!(event.previous.unwrap().code(), "CODE_ONE");
        assert_eq!(event.current.unwrap().code(), "CODE_TWO");
    }

    #[tokio::test]
    async fn test_purge_clears_cache_and_announces() {
        let h = harness(SchedulerConfig::default(), ScriptedFetcher::new(PAGE), at(1, 12));
        h.scheduler.refresh_now().await;
        let mut events = h.scheduler.subscribe();

        h.clock.set(at(1, 13));
        h.scheduler.purge().await.unwrap();

        assert!(h.scheduler.future(at(1, 13)).is_empty());
        let event = events.try_recv().unwrap();
        assert_eq!(event.current, None);

        let content = fs::read_to_string(h.scheduler.read_cache().path()).unwrap();
        assert!(content.contains("\"saved_at\": \"2024-01-01T13:00:00Z\""));
    }
}
