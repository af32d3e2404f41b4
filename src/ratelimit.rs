//! Fixed-window rate limiter for agent invocations.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::models::RateLimitState;

/// Length of the limiter window.
fn window() -> Duration {
    Duration::hours(1)
}

struct Inner {
    calls: i64,
    window_start: DateTime<Utc>,
}

/// Caps agent invocations per 1-hour window.
///
/// A limit of zero or below disables limiting. All methods take `&self`;
/// state lives behind a mutex so the limiter can be shared across tasks.
pub struct RateLimiter {
    limit: i64,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(limit: i64) -> Self {
        Self {
            limit,
            inner: Mutex::new(Inner {
                calls: 0,
                window_start: Utc::now(),
            }),
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit
    }

    pub fn is_disabled(&self) -> bool {
        self.limit <= 0
    }

    /// Admit one invocation if the window has room, rolling the window first
    /// when it has elapsed. Disabled limiters always admit.
    pub fn allow(&self) -> bool {
        if self.is_disabled() {
            return true;
        }
        let mut inner = self.inner.lock();
        Self::roll_window(&mut inner);
        if inner.calls < self.limit {
            inner.calls += 1;
            true
        } else {
            false
        }
    }

    /// Record an invocation unconditionally (used when the call already
    /// happened, e.g. a retry admitted by the operator).
    pub fn record(&self) {
        let mut inner = self.inner.lock();
        Self::roll_window(&mut inner);
        inner.calls += 1;
    }

    /// Calls left in the current window, or -1 when disabled.
    pub fn remaining(&self) -> i64 {
        if self.is_disabled() {
            return -1;
        }
        let mut inner = self.inner.lock();
        Self::roll_window(&mut inner);
        self.limit - inner.calls
    }

    /// Calls made in the current window.
    pub fn call_count(&self) -> i64 {
        let mut inner = self.inner.lock();
        Self::roll_window(&mut inner);
        inner.calls
    }

    /// Instant at which the current window rolls over.
    pub fn reset_time(&self) -> DateTime<Utc> {
        let inner = self.inner.lock();
        inner.window_start + window()
    }

    /// Snapshot for persistence.
    pub fn state(&self) -> RateLimitState {
        let inner = self.inner.lock();
        RateLimitState {
            calls: inner.calls,
            window_start: inner.window_start,
        }
    }

    /// Restore persisted state. Only windows that started in the past and
    /// less than one hour ago are accepted; anything else (including
    /// negative call counts) leaves the limiter fresh and returns false.
    pub fn restore_state(&self, state: &RateLimitState) -> bool {
        let now = Utc::now();
        let age = now - state.window_start;
        if state.calls < 0 || age < Duration::zero() || age >= window() {
            debug!(
                "discarding stale rate limit state (calls={}, window_start={})",
                state.calls, state.window_start
            );
            return false;
        }
        let mut inner = self.inner.lock();
        inner.calls = state.calls;
        inner.window_start = state.window_start;
        true
    }

    fn roll_window(inner: &mut Inner) {
        let now = Utc::now();
        if now - inner.window_start >= window() {
            debug!("rate limit window elapsed, resetting counter");
            inner.window_start = now;
            inner.calls = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_exactly_limit_calls_per_window() {
        let limiter = RateLimiter::new(3);
        for i in 0..3 {
            assert!(limiter.allow(), "call {} should be admitted", i);
        }
        assert!(!limiter.allow());
        assert!(!limiter.allow());
        assert_eq!(limiter.call_count(), 3);
    }

    #[test]
    fn remaining_plus_count_equals_limit() {
        let limiter = RateLimiter::new(5);
        for _ in 0..3 {
            limiter.allow();
        }
        assert_eq!(limiter.remaining() + limiter.call_count(), limiter.limit());

        limiter.record();
        limiter.record();
        limiter.record();
        assert_eq!(limiter.remaining() + limiter.call_count(), limiter.limit());
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let limiter = RateLimiter::new(0);
        assert!(limiter.is_disabled());
        for _ in 0..1000 {
            assert!(limiter.allow());
        }
        assert_eq!(limiter.remaining(), -1);

        let negative = RateLimiter::new(-5);
        assert!(negative.is_disabled());
        assert!(negative.allow());
    }

    #[test]
    fn elapsed_window_rolls_on_allow() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.allow());
        assert!(!limiter.allow());

        // Age the window past one hour by hand.
        {
            let mut inner = limiter.inner.lock();
            inner.window_start = Utc::now() - Duration::minutes(61);
        }
        assert!(limiter.allow());
        assert_eq!(limiter.call_count(), 1);
    }

    #[test]
    fn reset_time_is_window_start_plus_one_hour() {
        let limiter = RateLimiter::new(2);
        let state = limiter.state();
        assert_eq!(limiter.reset_time(), state.window_start + Duration::hours(1));
    }

    #[test]
    fn restore_accepts_only_recent_windows() {
        let limiter = RateLimiter::new(10);
        let good = RateLimitState {
            calls: 4,
            window_start: Utc::now() - Duration::minutes(30),
        };
        assert!(limiter.restore_state(&good));
        assert_eq!(limiter.call_count(), 4);

        let stale = RateLimitState {
            calls: 4,
            window_start: Utc::now() - Duration::minutes(90),
        };
        let fresh = RateLimiter::new(10);
        assert!(!fresh.restore_state(&stale));
        assert_eq!(fresh.call_count(), 0);

        let future = RateLimitState {
            calls: 1,
            window_start: Utc::now() + Duration::minutes(5),
        };
        assert!(!fresh.restore_state(&future));

        let negative = RateLimitState {
            calls: -1,
            window_start: Utc::now(),
        };
        assert!(!fresh.restore_state(&negative));
    }

    #[test]
    fn state_round_trips() {
        let limiter = RateLimiter::new(10);
        limiter.allow();
        limiter.allow();
        let state = limiter.state();

        let restored = RateLimiter::new(10);
        assert!(restored.restore_state(&state));
        assert_eq!(restored.call_count(), 2);
        assert_eq!(restored.remaining(), 8);
    }
}
