//! Freshness tracking for cached files
//!
//! Maps a cache key (case-folded full local path) to the instant after which
//! the local copy must be revalidated against the remote store. Concurrent
//! writers to the same key race; the last write wins.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use moka::sync::Cache;
use tracing::{trace, warn};

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// The real system clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Longest trust window a tracker will open
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// An open trust window
#[derive(Debug, Clone)]
struct Window {
    expires_at: SystemTime,
    /// Remote object the cached copy was validated against
    object_name: String,
}

/// Trust windows keyed by cache key
pub struct FreshnessTracker {
    windows: Cache<String, Window>,
    /// Length of a trust window
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl FreshnessTracker {
    /// Create a tracker whose windows last `ttl`, capped at [`MAX_TTL`]
    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let ttl = ttl.min(MAX_TTL);
        let mut builder = Cache::builder().name("freshness_windows");
        // Entries past their window are useless; let moka drop them so the
        // table does not grow with every path ever requested.
        if !ttl.is_zero() {
            builder = builder.time_to_live(ttl);
        }

        Self {
            windows: builder.build(),
            ttl,
            clock,
        }
    }

    /// Name of the remote object trusted for `key`, or `None` when `key` has
    /// no window or its window has lapsed
    pub fn trusted_object(&self, key: &str) -> Option<String> {
        let trusted = self
            .windows
            .get(key)
            .filter(|window| self.clock.now() < window.expires_at)
            .map(|window| window.object_name);
        trace!(key = key, fresh = trusted.is_some(), "Checked freshness");
        trusted
    }

    /// Open a new trust window for `key`, replacing any previous one
    pub fn mark_fresh(&self, key: &str, object_name: &str) {
        let Some(expires_at) = self.clock.now().checked_add(self.ttl) else {
            warn!(key = key, "Trust window end is not representable, not caching");
            return;
        };
        let window = Window {
            expires_at,
            object_name: object_name.to_string(),
        };
        self.windows.insert(key.to_string(), window);
        trace!(key = key, ttl_secs = self.ttl.as_secs(), "Marked fresh");
    }

    /// Approximate number of tracked keys
    pub fn entry_count(&self) -> u64 {
        self.windows.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::UNIX_EPOCH;

    fn tracker(ttl_secs: u64) -> (Arc<ManualClock>, FreshnessTracker) {
        let clock = Arc::new(ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_700_000_000)));
        let tracker = FreshnessTracker::with_clock(Duration::from_secs(ttl_secs), clock.clone());
        (clock, tracker)
    }

    fn expires_at(tracker: &FreshnessTracker, key: &str) -> Option<SystemTime> {
        tracker.windows.get(key).map(|window| window.expires_at)
    }

    fn is_fresh(tracker: &FreshnessTracker, key: &str) -> bool {
        tracker.trusted_object(key).is_some()
    }

    #[test]
    fn test_unknown_key_is_stale() {
        let (_, tracker) = tracker(300);
        assert!(!is_fresh(&tracker, "/cache/a"));
        assert!(expires_at(&tracker, "/cache/a").is_none());
    }

    #[test]
    fn test_window_lapses() {
        let (clock, tracker) = tracker(300);
        tracker.mark_fresh("/cache/a", "a");
        assert!(is_fresh(&tracker, "/cache/a"));

        clock.advance(Duration::from_secs(299));
        assert!(is_fresh(&tracker, "/cache/a"));

        // Fresh only strictly before the expiry instant
        clock.advance(Duration::from_secs(1));
        assert!(!is_fresh(&tracker, "/cache/a"));
    }

    #[test]
    fn test_mark_fresh_rearms_window() {
        let (clock, tracker) = tracker(300);
        tracker.mark_fresh("/cache/a", "a");
        let first = expires_at(&tracker, "/cache/a").unwrap();

        clock.advance(Duration::from_secs(400));
        assert!(!is_fresh(&tracker, "/cache/a"));

        tracker.mark_fresh("/cache/a", "a");
        assert!(is_fresh(&tracker, "/cache/a"));
        assert_eq!(
            expires_at(&tracker, "/cache/a").unwrap(),
            first + Duration::from_secs(400)
        );
    }

    #[test]
    fn test_zero_ttl_is_never_fresh() {
        let (_, tracker) = tracker(0);
        tracker.mark_fresh("/cache/a", "a");
        assert!(!is_fresh(&tracker, "/cache/a"));
    }

    #[test]
    fn test_concurrent_marks() {
        let (_, tracker) = tracker(300);
        let tracker = Arc::new(tracker);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        tracker.mark_fresh(&format!("/cache/{}", (i * j) % 10), "obj");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        for k in 0..10 {
            assert!(is_fresh(&tracker, &format!("/cache/{}", k)));
        }
    }

    #[test]
    fn test_window_remembers_object_name() {
        let (_, tracker) = tracker(300);
        tracker.mark_fresh("/cache/report", "report-2024.csv");
        assert_eq!(
            tracker.trusted_object("/cache/report").as_deref(),
            Some("report-2024.csv")
        );

        tracker.mark_fresh("/cache/report", "report-2025.csv");
        assert_eq!(
            tracker.trusted_object("/cache/report").as_deref(),
            Some("report-2025.csv")
        );
    }

    #[test]
    fn test_oversized_ttl_is_capped() {
        let (clock, tracker) = tracker(u64::MAX);
        tracker.mark_fresh("/cache/a", "a");
        assert_eq!(expires_at(&tracker, "/cache/a").unwrap(), clock.now() + MAX_TTL);
        assert!(is_fresh(&tracker, "/cache/a"));
    }

    #[cfg(unix)]
    #[test]
    fn test_unrepresentable_expiry_is_not_recorded() {
        let clock = Arc::new(ManualClock::new(
            UNIX_EPOCH + Duration::from_secs(i64::MAX as u64 - 100),
        ));
        let tracker = FreshnessTracker::with_clock(Duration::from_secs(300), clock);
        tracker.mark_fresh("/cache/a", "a");
        assert!(!is_fresh(&tracker, "/cache/a"));
    }
}
