//! Audit rate limiting
//!
//! Token bucket refilled continuously at the configured rate. The auditor
//! keeps one for files per second and one for bytes per second and blocks
//! until the next file or chunk is allowed.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const SCALE: u64 = 1000;
const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Blocking token bucket; a rate of zero means unlimited
#[derive(Debug)]
pub struct TokenBucket {
    /// Current token count (scaled by 1000 for sub-token precision)
    tokens: AtomicU64,
    /// Maximum tokens (burst capacity), scaled
    max_tokens: u64,
    /// Tokens added per second, scaled
    refill_rate: u64,
    last_refill: Mutex<Instant>,
}

impl TokenBucket {
    /// Bucket refilling at `rate` tokens per second and holding at most
    /// `burst` tokens
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn new(rate: f64, burst: f64) -> Self {
        let scaled = |v: f64| (v.max(0.0) * SCALE as f64) as u64;
        let max_tokens = scaled(burst).max(SCALE);
        Self {
            tokens: AtomicU64::new(max_tokens),
            max_tokens,
            refill_rate: scaled(rate),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    /// Bucket allowing one second worth of burst
    #[must_use]
    pub fn per_second(rate: f64) -> Self {
        Self::new(rate, rate)
    }

    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.refill_rate == 0
    }

    /// Take `count` tokens if available right now
    pub fn try_acquire(&self, count: u64) -> bool {
        if self.is_unlimited() {
            return true;
        }
        self.refill();
        self.take(count.saturating_mul(SCALE))
    }

    /// Take `count` tokens, sleeping until they are available.
    ///
    /// Requests larger than the burst only wait for a full bucket. Returns
    /// how long the caller slept.
    pub fn acquire(&self, count: u64) -> Duration {
        if self.is_unlimited() || count == 0 {
            return Duration::ZERO;
        }
        let needed = count.saturating_mul(SCALE).min(self.max_tokens);
        let start = Instant::now();
        loop {
            self.refill();
            if self.take(needed) {
                return start.elapsed();
            }
            let deficit = needed.saturating_sub(self.tokens.load(Ordering::Relaxed));
            let wait = Duration::from_micros(deficit.saturating_mul(1_000_000) / self.refill_rate);
            std::thread::sleep(wait.max(MIN_SLEEP));
        }
    }

    /// Tokens available now
    #[must_use]
    pub fn available(&self) -> u64 {
        self.refill();
        self.tokens.load(Ordering::Relaxed) / SCALE
    }

    fn take(&self, needed: u64) -> bool {
        let mut current = self.tokens.load(Ordering::Relaxed);
        loop {
            if current < needed {
                return false;
            }
            match self.tokens.compare_exchange_weak(
                current,
                current - needed,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let now = Instant::now();
        #[allow(clippy::cast_possible_truncation)]
        let elapsed_us = now.duration_since(*last).as_micros() as u64;
        let new_tokens = elapsed_us.saturating_mul(self.refill_rate) / 1_000_000;

        if new_tokens > 0 {
            let current = self.tokens.load(Ordering::Relaxed);
            let new_value = current.saturating_add(new_tokens).min(self.max_tokens);
            self.tokens.store(new_value, Ordering::Relaxed);
            *last = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_empty() {
        let bucket = TokenBucket::new(10.0, 5.0);
        assert_eq!(bucket.available(), 5);
        assert!(bucket.try_acquire(3));
        assert!(bucket.try_acquire(2));
        assert!(!bucket.try_acquire(1));
    }

    #[test]
    fn test_acquire_waits_for_refill() {
        let bucket = TokenBucket::new(100.0, 1.0);
        assert_eq!(bucket.acquire(1), Duration::ZERO);
        // Next token is ~10ms away
        let slept = bucket.acquire(1);
        assert!(slept >= Duration::from_millis(5), "slept {slept:?}");
    }

    #[test]
    fn test_oversized_request_waits_for_full_bucket_only() {
        let bucket = TokenBucket::new(1000.0, 10.0);
        let slept = bucket.acquire(1_000_000);
        assert!(slept < Duration::from_secs(1));
    }

    #[test]
    fn test_unlimited() {
        let bucket = TokenBucket::per_second(0.0);
        assert!(bucket.is_unlimited());
        for _ in 0..1000 {
            assert!(bucket.try_acquire(1024 * 1024));
            assert_eq!(bucket.acquire(1024 * 1024), Duration::ZERO);
        }
    }

    #[test]
    fn test_fractional_rate() {
        // Half a file per second still allows the first one immediately
        let bucket = TokenBucket::per_second(0.5);
        assert!(!bucket.is_unlimited());
        assert!(bucket.try_acquire(1));
        assert!(!bucket.try_acquire(1));
    }
}
