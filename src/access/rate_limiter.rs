//! Fixed-window request counter keyed by client address.
//!
//! # Algorithm
//!
//! Each address owns one window:
//!
//! ```text
//! first request / now > reset_at  →  count = 1, reset_at = now + window   (allow)
//! count < max_requests            →  count += 1                           (allow)
//! otherwise                       →  unchanged                            (deny)
//! ```
//!
//! Denied requests do not bump the counter, so the count never exceeds
//! `max_requests` and the window resets on schedule.
//!
//! # Concurrency
//!
//! Windows live in a [`DashMap`]; the read-modify-write for one address
//! happens under that key's shard lock, so concurrent requests from the same
//! address cannot lose increments.
//!
//! # Known limitation
//!
//! State is process-local and lost on restart: an address that exhausted its
//! window gets a fresh one after a deploy, and several replicas each count
//! independently. This is a coarse defense-in-depth layer; the persisted
//! block registry is the authoritative record.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::clock::SharedClock;

/// Requests allowed per window, and the window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl RatePolicy {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }
}

impl Default for RatePolicy {
    /// 100 requests per 60 seconds.
    fn default() -> Self {
        Self::new(100, Duration::seconds(60))
    }
}

/// Counter state for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub count: u32,
    pub reset_at: DateTime<Utc>,
}

/// Result of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Per-address fixed-window limiter.
///
/// Owned by the application state and injected into the access guard, so
/// each test (or each router) gets its own counters.
#[derive(Clone)]
pub struct FixedWindowLimiter {
    windows: Arc<DashMap<String, RateWindow>>,
    policy: RatePolicy,
    clock: SharedClock,
}

impl FixedWindowLimiter {
    pub fn new(policy: RatePolicy, clock: SharedClock) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> RatePolicy {
        self.policy
    }

    /// Count one request from `address` and decide whether it may proceed.
    pub fn check(&self, address: &str) -> RateDecision {
        let now = self.clock.now();
        let fresh = RateWindow {
            count: 1,
            reset_at: now + self.policy.window,
        };
        let allowed_fresh = RateDecision::Allowed {
            remaining: self.policy.max_requests.saturating_sub(1),
        };

        match self.windows.entry(address.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                allowed_fresh
            }
            Entry::Occupied(mut occupied) => {
                let window = occupied.get_mut();
                if now > window.reset_at {
                    *window = fresh;
                    allowed_fresh
                } else if window.count < self.policy.max_requests {
                    window.count += 1;
                    RateDecision::Allowed {
                        remaining: self.policy.max_requests - window.count,
                    }
                } else {
                    RateDecision::Limited {
                        retry_after: window.reset_at - now,
                    }
                }
            }
        }
    }

    /// Current window for `address`, if any.
    pub fn window(&self, address: &str) -> Option<RateWindow> {
        self.windows.get(address).map(|w| *w)
    }

    /// Drop windows that have already lapsed; returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.windows.len();
        self.windows.retain(|_, window| now <= window.reset_at);
        before.saturating_sub(self.windows.len())
    }

    /// Number of addresses with a live window.
    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(max: u32, window_secs: i64) -> (FixedWindowLimiter, ManualClock) {
        let clock = ManualClock::default();
        let limiter = FixedWindowLimiter::new(
            RatePolicy::new(max, Duration::seconds(window_secs)),
            Arc::new(clock.clone()),
        );
        (limiter, clock)
    }

    #[test]
    fn test_allows_up_to_max_then_denies() {
        let (limiter, _clock) = limiter(100, 60);
        for i in 0..100 {
            assert!(
                limiter.check("203.0.113.9").is_allowed(),
                "request {} should pass",
                i + 1
            );
        }
        assert!(matches!(
            limiter.check("203.0.113.9"),
            RateDecision::Limited { .. }
        ));
    }

    #[test]
    fn test_denied_requests_do_not_increment() {
        let (limiter, _clock) = limiter(3, 60);
        for _ in 0..10 {
            limiter.check("192.0.2.1");
        }
        assert_eq!(limiter.window("192.0.2.1").unwrap().count, 3);
    }

    #[test]
    fn test_window_resets_after_elapsed() {
        let (limiter, clock) = limiter(2, 60);
        limiter.check("192.0.2.1");
        limiter.check("192.0.2.1");
        assert!(!limiter.check("192.0.2.1").is_allowed());

        clock.advance(Duration::seconds(61));
        assert_eq!(
            limiter.check("192.0.2.1"),
            RateDecision::Allowed { remaining: 1 }
        );
        assert_eq!(limiter.window("192.0.2.1").unwrap().count, 1);
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let (limiter, clock) = limiter(1, 60);
        limiter.check("192.0.2.1");
        // Reset only once now is strictly past reset_at
        clock.advance(Duration::seconds(60));
        assert!(!limiter.check("192.0.2.1").is_allowed());
        clock.advance(Duration::milliseconds(1));
        assert!(limiter.check("192.0.2.1").is_allowed());
    }

    #[test]
    fn test_retry_after_counts_down() {
        let (limiter, clock) = limiter(1, 60);
        limiter.check("192.0.2.1");
        clock.advance(Duration::seconds(20));
        assert_eq!(
            limiter.check("192.0.2.1"),
            RateDecision::Limited {
                retry_after: Duration::seconds(40)
            }
        );
    }

    #[test]
    fn test_addresses_are_independent() {
        let (limiter, _clock) = limiter(1, 60);
        assert!(limiter.check("192.0.2.1").is_allowed());
        assert!(limiter.check("192.0.2.2").is_allowed());
        assert!(!limiter.check("192.0.2.1").is_allowed());
    }

    #[test]
    fn test_prune_drops_only_lapsed_windows() {
        let (limiter, clock) = limiter(10, 60);
        limiter.check("192.0.2.1");
        clock.advance(Duration::seconds(30));
        limiter.check("192.0.2.2");
        clock.advance(Duration::seconds(31));

        assert_eq!(limiter.prune_expired(), 1);
        assert_eq!(limiter.tracked(), 1);
        assert!(limiter.window("192.0.2.2").is_some());
    }

    #[test]
    fn test_concurrent_checks_never_exceed_max() {
        let (limiter, _clock) = limiter(500, 60);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|_| limiter.check("198.51.100.1").is_allowed())
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 500);
        assert_eq!(limiter.window("198.51.100.1").unwrap().count, 500);
    }
}
