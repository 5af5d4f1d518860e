//! In-memory bookkeeping of delivery failures, keyed by message id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use postbus_core::CapturedError;

use crate::settings::RetryStrategySettings;

/// Per-message failure history.
///
/// Implementations must be safe to share between workers; operations for one id
/// are atomic with respect to each other.
pub trait ErrorTracker: Send + Sync {
    /// Append a snapshot, creating the tracking if absent.
    fn register_error(&self, message_id: &str, error: CapturedError);

    /// True once the registered count reaches the max delivery attempts, or the
    /// tracking was marked final.
    fn has_failed_too_many_times(&self, message_id: &str) -> bool;

    /// Flag the tracking as terminal, creating it if absent.
    fn mark_as_final(&self, message_id: &str);

    /// Registered snapshots, oldest first. Empty if nothing is tracked.
    fn get_exceptions(&self, message_id: &str) -> Vec<CapturedError>;

    /// Newline-joined full descriptions, or `None` if nothing is tracked.
    fn get_full_error_description(&self, message_id: &str) -> Option<String>;

    /// Discard the tracking. Safe to call for unknown ids.
    fn clean_up(&self, message_id: &str);
}

#[derive(Debug)]
struct Tracking {
    errors: Vec<CapturedError>,
    is_final: bool,
    last_activity: DateTime<Utc>,
}

impl Tracking {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            errors: Vec::new(),
            is_final: false,
            last_activity: now,
        }
    }
}

/// Process-local [`ErrorTracker`].
///
/// The outer map is only write-locked to create or drop trackings; registrations
/// for existing ids lock just their own entry.
#[derive(Debug)]
pub struct InMemoryErrorTracker {
    trackings: RwLock<HashMap<String, Arc<Mutex<Tracking>>>>,
    max_delivery_attempts: u32,
    max_age: TimeDelta,
}

impl InMemoryErrorTracker {
    pub fn new(max_delivery_attempts: u32, max_age: Duration) -> Self {
        Self {
            trackings: RwLock::new(HashMap::new()),
            max_delivery_attempts,
            max_age: TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX),
        }
    }

    pub fn from_settings(settings: &RetryStrategySettings) -> Self {
        Self::new(
            settings.max_delivery_attempts(),
            settings.error_tracking_max_age(),
        )
    }

    /// Idle time after which a tracking is considered stale.
    pub fn max_age(&self) -> Duration {
        self.max_age.to_std().unwrap_or(Duration::MAX)
    }

    /// Number of ids currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.trackings.read().len()
    }

    /// Drop trackings idle for longer than the max age, as of `now`.
    /// Returns how many were dropped.
    pub fn reap_stale(&self, now: DateTime<Utc>) -> usize {
        let mut trackings = self.trackings.write();
        let before = trackings.len();
        trackings.retain(|_, tracking| now - tracking.lock().last_activity <= self.max_age);
        before - trackings.len()
    }

    /// Run [`reap_stale`](Self::reap_stale) every `interval` until `shutdown` fires.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = tracker.reap_stale(Utc::now());
                        if reaped > 0 {
                            debug!(reaped, "dropped stale error trackings");
                        }
                    }
                }
            }
        })
    }

    /// Run `f` against the tracking for `message_id`, creating it if absent.
    fn with_tracking<R>(&self, message_id: &str, f: impl FnOnce(&mut Tracking) -> R) -> R {
        let now = Utc::now();
        {
            let trackings = self.trackings.read();
            if let Some(tracking) = trackings.get(message_id) {
                let mut tracking = tracking.lock();
                tracking.last_activity = now;
                return f(&mut tracking);
            }
        }

        let mut trackings = self.trackings.write();
        let tracking = trackings
            .entry(message_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Tracking::new(now))));
        let mut tracking = tracking.lock();
        tracking.last_activity = now;
        f(&mut tracking)
    }

    fn read_tracking<R>(&self, message_id: &str, f: impl FnOnce(&Tracking) -> R) -> Option<R> {
        let trackings = self.trackings.read();
        trackings.get(message_id).map(|tracking| f(&tracking.lock()))
    }
}

impl ErrorTracker for InMemoryErrorTracker {
    fn register_error(&self, message_id: &str, error: CapturedError) {
        let count = self.with_tracking(message_id, |tracking| {
            tracking.errors.push(error);
            tracking.errors.len()
        });
        debug!(message_id, count, "registered delivery failure");
    }

    fn has_failed_too_many_times(&self, message_id: &str) -> bool {
        self.read_tracking(message_id, |tracking| {
            tracking.is_final || tracking.errors.len() >= self.max_delivery_attempts as usize
        })
        .unwrap_or(false)
    }

    fn mark_as_final(&self, message_id: &str) {
        self.with_tracking(message_id, |tracking| tracking.is_final = true);
    }

    fn get_exceptions(&self, message_id: &str) -> Vec<CapturedError> {
        self.read_tracking(message_id, |tracking| tracking.errors.clone())
            .unwrap_or_default()
    }

    fn get_full_error_description(&self, message_id: &str) -> Option<String> {
        self.read_tracking(message_id, |tracking| {
            tracking
                .errors
                .iter()
                .map(CapturedError::full_description)
                .collect::<Vec<_>>()
                .join("\n")
        })
    }

    fn clean_up(&self, message_id: &str) {
        self.trackings.write().remove(message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tracker(max: u32) -> InMemoryErrorTracker {
        InMemoryErrorTracker::new(max, Duration::from_secs(600))
    }

    fn err(message: &str) -> CapturedError {
        CapturedError::synthetic("ApplicationError", message)
    }

    #[test]
    fn nothing_tracked_for_unknown_id() {
        let tracker = tracker(3);
        assert!(!tracker.has_failed_too_many_times("m1"));
        assert!(tracker.get_exceptions("m1").is_empty());
        assert_eq!(tracker.get_full_error_description("m1"), None);
    }

    #[test]
    fn register_then_read_returns_the_error() {
        let tracker = tracker(3);
        tracker.register_error("m1", err("boom"));

        let errors = tracker.get_exceptions("m1");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message(), "boom");
    }

    #[test]
    fn threshold_is_reached_at_max_attempts() {
        let tracker = tracker(2);
        tracker.register_error("m1", err("one"));
        assert!(!tracker.has_failed_too_many_times("m1"));
        tracker.register_error("m1", err("two"));
        assert!(tracker.has_failed_too_many_times("m1"));
    }

    #[test]
    fn zero_attempts_fails_on_first_registration() {
        let tracker = tracker(0);
        assert!(!tracker.has_failed_too_many_times("m1"));
        tracker.register_error("m1", err("one"));
        assert!(tracker.has_failed_too_many_times("m1"));
    }

    #[test]
    fn final_tracking_counts_as_exhausted() {
        let tracker = tracker(10);
        tracker.mark_as_final("m1");
        assert!(tracker.has_failed_too_many_times("m1"));
        assert_eq!(tracker.get_full_error_description("m1").as_deref(), Some(""));
    }

    #[test]
    fn ids_are_tracked_independently() {
        let tracker = tracker(1);
        tracker.register_error("m1", err("boom"));
        assert!(tracker.has_failed_too_many_times("m1"));
        assert!(!tracker.has_failed_too_many_times("m2"));
    }

    #[test]
    fn description_joins_full_descriptions() {
        let tracker = tracker(3);
        let first = err("first");
        let second = err("second");
        tracker.register_error("m1", first.clone());
        tracker.register_error("m1", second.clone());

        let description = tracker.get_full_error_description("m1").unwrap();
        assert_eq!(
            description,
            format!("{}\n{}", first.full_description(), second.full_description())
        );
    }

    #[test]
    fn stale_trackings_are_reaped() {
        let tracker = InMemoryErrorTracker::new(3, Duration::from_secs(60));
        tracker.register_error("old", err("boom"));

        assert_eq!(tracker.reap_stale(Utc::now()), 0);
        assert_eq!(tracker.reap_stale(Utc::now() + TimeDelta::seconds(61)), 1);
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[tokio::test]
    async fn reaper_stops_on_shutdown() {
        let tracker = Arc::new(tracker(3));
        let shutdown = CancellationToken::new();
        let handle = tracker.spawn_reaper(Duration::from_millis(5), shutdown.clone());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn concurrent_registrations_are_not_lost() {
        let tracker = Arc::new(tracker(1000));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        tracker.register_error("shared", err("boom"));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(tracker.get_exceptions("shared").len(), 400);
    }

    proptest! {
        #[test]
        fn registration_order_is_preserved(messages in proptest::collection::vec("[a-z]{1,8}", 1..20)) {
            let tracker = tracker(100);
            for message in &messages {
                tracker.register_error("m1", err(message));
            }
            let read: Vec<String> = tracker
                .get_exceptions("m1")
                .iter()
                .map(|e| e.message().to_string())
                .collect();
            prop_assert_eq!(read, messages);
        }

        #[test]
        fn clean_up_is_idempotent(count in 0usize..5, cleanups in 1usize..4) {
            let tracker = tracker(3);
            for _ in 0..count {
                tracker.register_error("m1", err("boom"));
            }
            for _ in 0..cleanups {
                tracker.clean_up("m1");
                prop_assert!(tracker.get_exceptions("m1").is_empty());
                prop_assert_eq!(tracker.get_full_error_description("m1"), None);
                prop_assert_eq!(tracker.tracked_count(), 0);
            }
        }
    }
}
