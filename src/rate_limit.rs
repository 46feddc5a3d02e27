//! Client-side sliding-window limiter for chat requests.
//!
//! Tracks requests and tokens over the last minute and tells the caller
//! how long to wait before the next request fits within the configured
//! requests-per-minute and tokens-per-minute budgets.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimits {
    /// Requests per minute (0 = unlimited).
    pub rpm: usize,
    /// Tokens per minute (0 = unlimited).
    pub tpm: usize,
}

pub struct RateLimiter {
    limits: RateLimits,
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, usize)>,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limits: RateLimits) -> Self {
        Self::with_window(limits, Duration::from_secs(60))
    }

    pub fn with_window(limits: RateLimits, window: Duration) -> Self {
        Self {
            limits,
            requests: VecDeque::new(),
            tokens: VecDeque::new(),
            window,
        }
    }

    /// Returns `None` when a request of `estimated_tokens` may go now, or
    /// the delay until the oldest entry leaves the window.
    pub fn check(&mut self, estimated_tokens: usize) -> Option<Duration> {
        let now = Instant::now();
        self.prune(now);

        if self.limits.rpm > 0 && self.requests.len() >= self.limits.rpm {
            if let Some(&oldest) = self.requests.front() {
                let wait = self.window.saturating_sub(now.duration_since(oldest));
                if !wait.is_zero() {
                    return Some(wait);
                }
            }
        }

        if self.limits.tpm > 0 {
            let used: usize = self.tokens.iter().map(|(_, t)| t).sum();
            if used + estimated_tokens > self.limits.tpm {
                if let Some(&(oldest, _)) = self.tokens.front() {
                    let wait = self.window.saturating_sub(now.duration_since(oldest));
                    if !wait.is_zero() {
                        return Some(wait);
                    }
                }
            }
        }

        None
    }

    /// Record a completed request and the tokens it consumed.
    pub fn record(&mut self, tokens: usize) {
        let now = Instant::now();
        self.requests.push_back(now);
        if tokens > 0 {
            self.tokens.push_back((now, tokens));
        }
    }

    /// Tokens consumed within the current window.
    pub fn tokens_in_window(&mut self) -> usize {
        self.prune(Instant::now());
        self.tokens.iter().map(|(_, t)| t).sum()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&t) = self.requests.front() {
            if now.duration_since(t) >= self.window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
        while let Some(&(t, _)) = self.tokens.front() {
            if now.duration_since(t) >= self.window {
                self.tokens.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_waits() {
        let mut limiter = RateLimiter::new(RateLimits::default());
        for _ in 0..100 {
            limiter.record(10_000);
            assert!(limiter.check(10_000).is_none());
        }
    }

    #[test]
    fn test_rpm_limit() {
        let mut limiter = RateLimiter::new(RateLimits { rpm: 2, tpm: 0 });
        assert!(limiter.check(0).is_none());
        limiter.record(0);
        assert!(limiter.check(0).is_none());
        limiter.record(0);
        let wait = limiter.check(0).expect("third request should wait");
        assert!(wait <= Duration::from_secs(60));
    }

    #[test]
    fn test_tpm_limit() {
        let mut limiter = RateLimiter::new(RateLimits { rpm: 0, tpm: 1000 });
        limiter.record(800);
        assert!(limiter.check(100).is_none());
        assert!(limiter.check(300).is_some());
        assert_eq!(limiter.tokens_in_window(), 800);
    }

    #[test]
    fn test_window_expiry() {
        let mut limiter =
            RateLimiter::with_window(RateLimits { rpm: 1, tpm: 0 }, Duration::from_millis(10));
        limiter.record(0);
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.check(0).is_none());
    }
}
