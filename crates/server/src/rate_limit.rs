//! Fixed-window request throttle for the chat endpoint.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);
/// Stale per-key windows are pruned once the map grows past this.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// Per-key fixed-window counter: at most `limit` acquisitions per minute.
/// The window resets on first use after expiry, so a burst straddling a
/// boundary can see up to twice the limit.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self { limit: limit_per_minute.max(1), windows: Mutex::new(HashMap::new()) }
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        let mut windows = match self.windows.lock() {
            Ok(windows) => windows,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();

        if windows.len() > PRUNE_THRESHOLD {
            windows.retain(|_, window| now.duration_since(window.started_at) < WINDOW);
        }

        let window =
            windows.entry(key.to_string()).or_insert(Window { started_at: now, count: 0 });
        if now.duration_since(window.started_at) >= WINDOW {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= self.limit {
            return false;
        }
        window.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::RateLimiter;

    #[test]
    fn allows_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new(3);

        assert!(limiter.try_acquire("session-1"));
        assert!(limiter.try_acquire("session-1"));
        assert!(limiter.try_acquire("session-1"));
        assert!(!limiter.try_acquire("session-1"));
    }

    #[test]
    fn keys_are_counted_independently() {
        let limiter = RateLimiter::new(1);

        assert!(limiter.try_acquire("session-1"));
        assert!(limiter.try_acquire("session-2"));
        assert!(!limiter.try_acquire("session-1"));
    }

    #[test]
    fn zero_limit_still_admits_one_request() {
        let limiter = RateLimiter::new(0);

        assert!(limiter.try_acquire("session-1"));
        assert!(!limiter.try_acquire("session-1"));
    }
}
