// Fixed-window rate limiting keyed by client identity
//
// Up to 2 * limit requests can pass in a short span straddling a window
// boundary. Swap in a sliding-window or token-bucket limiter here if stricter
// burst control is ever required.

use crate::chat::clock::{duration_millis, now_millis};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Counter state for a single key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    /// End of the current window, ms since the Unix epoch
    pub window_end: u64,
}

/// Limit applied to one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub limit: u32,
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            limit: 6,
            window: Duration::from_millis(60_000),
        }
    }
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
}

/// Process-local fixed-window limiter
#[derive(Default)]
pub struct RateLimiter {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request from `key` against the current time
    pub fn check_and_increment(&self, key: &str, limit: u32, window: Duration) -> RateDecision {
        self.check_and_increment_at(key, limit, window, now_millis())
    }

    /// Count a request from `key` at an explicit instant
    pub fn check_and_increment_at(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: u64,
    ) -> RateDecision {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(key) {
            if entry.window_end >= now {
                if entry.count >= limit {
                    return RateDecision {
                        allowed: false,
                        remaining: 0,
                    };
                }
                entry.count += 1;
                return RateDecision {
                    allowed: true,
                    remaining: limit - entry.count,
                };
            }
        }

        // First request from this key, or its window has elapsed
        entries.insert(
            key.to_string(),
            RateLimitEntry {
                count: 1,
                window_end: now.saturating_add(duration_millis(window)),
            },
        );
        RateDecision {
            allowed: true,
            remaining: limit.saturating_sub(1),
        }
    }

    /// Count a request from `key` under `policy`
    pub fn check(&self, key: &str, policy: RateLimitPolicy) -> RateDecision {
        self.check_and_increment(key, policy.limit, policy.window)
    }

    /// Current entry for a key, if any
    pub fn entry(&self, key: &str) -> Option<RateLimitEntry> {
        self.entries.lock().get(key).copied()
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries whose window ended before `now`
    pub fn purge_expired_at(&self, now: u64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.window_end >= now);
        before - entries.len()
    }

    /// Start background task to purge expired entries
    pub fn start_cleanup_task(self: Arc<Self>, interval: Duration) {
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);

            loop {
                interval_timer.tick().await;

                let removed = self.purge_expired_at(now_millis());
                if removed > 0 {
                    tracing::debug!(
                        "Purged {} expired rate limit entries ({} remaining)",
                        removed,
                        self.len()
                    );
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: u32 = 6;
    const WINDOW: Duration = Duration::from_millis(60_000);

    #[test]
    fn test_sixth_allowed_seventh_denied() {
        let limiter = RateLimiter::new();
        let now = 1_000_000;

        for i in 1..=LIMIT {
            let decision = limiter.check_and_increment_at("1.2.3.4", LIMIT, WINDOW, now);
            assert!(decision.allowed, "request {i} should pass");
            assert_eq!(decision.remaining, LIMIT - i);
        }

        let denied = limiter.check_and_increment_at("1.2.3.4", LIMIT, WINDOW, now + 10);
        assert_eq!(
            denied,
            RateDecision {
                allowed: false,
                remaining: 0
            }
        );
    }

    #[test]
    fn test_window_reset() {
        let limiter = RateLimiter::new();
        let now = 1_000_000;

        for _ in 0..=LIMIT {
            limiter.check_and_increment_at("k", LIMIT, WINDOW, now);
        }
        assert!(!limiter.check_and_increment_at("k", LIMIT, WINDOW, now + 60_000).allowed);

        let after = limiter.check_and_increment_at("k", LIMIT, WINDOW, now + 60_001);
        assert!(after.allowed);
        assert_eq!(after.remaining, LIMIT - 1);
        assert_eq!(limiter.entry("k").unwrap().window_end, now + 60_001 + 60_000);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..LIMIT {
            limiter.check_and_increment_at("a", LIMIT, WINDOW, 0);
        }
        assert!(!limiter.check_and_increment_at("a", LIMIT, WINDOW, 0).allowed);
        assert!(limiter.check_and_increment_at("b", LIMIT, WINDOW, 0).allowed);
    }

    #[test]
    fn test_boundary_burst_is_allowed() {
        let limiter = RateLimiter::new();
        let mut passed = 0;
        for _ in 0..LIMIT {
            passed += limiter.check_and_increment_at("k", LIMIT, WINDOW, 59_999).allowed as u32;
        }
        for _ in 0..LIMIT {
            passed += limiter.check_and_increment_at("k", LIMIT, WINDOW, 120_000).allowed as u32;
        }
        assert_eq!(passed, 2 * LIMIT);
    }

    #[test]
    fn test_purge_expired() {
        let limiter = RateLimiter::new();
        limiter.check_and_increment_at("old", LIMIT, WINDOW, 0);
        limiter.check_and_increment_at("new", LIMIT, WINDOW, 100_000);

        assert_eq!(limiter.purge_expired_at(100_000), 1);
        assert!(limiter.entry("old").is_none());
        assert!(limiter.entry("new").is_some());
    }

    #[test]
    fn test_concurrent_requests_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new());
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    limiter.check_and_increment_at("k", LIMIT, WINDOW, 0).allowed
                })
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();
        assert_eq!(allowed, LIMIT as usize);
    }
}
