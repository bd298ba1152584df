//! Token-bucket rate limiter shared by all resolver-pool callers.
//!
//! The bucket is a single atomic counter refilled from elapsed wall time;
//! callers that find it empty sleep until the next token lands.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// A token bucket admitting `rate` operations per second with a burst
/// capacity of one second's worth of tokens.
#[derive(Debug)]
pub struct TokenBucket {
    rate_per_sec: u32,
    tokens: AtomicI64,
    last_refill: Mutex<Instant>,
}

impl TokenBucket {
    pub fn new(rate_per_sec: u32) -> Self {
        Self {
            rate_per_sec,
            tokens: AtomicI64::new(i64::from(rate_per_sec)),
            last_refill: Mutex::new(Instant::now()),
        }
    }

    /// Take one token, waiting for a refill when the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            self.refill();
            if self.try_take() {
                return;
            }
            // One token lands every 1/rate seconds.
            let wait = Duration::from_secs_f64(1.0 / f64::from(self.rate_per_sec.max(1)));
            tokio::time::sleep(wait).await;
        }
    }

    /// Take one token without waiting. Returns false when empty.
    pub fn try_take(&self) -> bool {
        self.refill();
        let prev = self.tokens.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            self.tokens.fetch_add(1, Ordering::AcqRel);
            false
        } else {
            true
        }
    }

    fn refill(&self) {
        let mut last = self
            .last_refill
            .lock()
            .expect("token bucket clock poisoned");
        let elapsed = last.elapsed();
        let new_tokens = (elapsed.as_secs_f64() * f64::from(self.rate_per_sec)) as i64;
        if new_tokens > 0 {
            *last += Duration::from_secs_f64(new_tokens as f64 / f64::from(self.rate_per_sec));
            let cap = i64::from(self.rate_per_sec);
            let current = self.tokens.load(Ordering::Acquire);
            let refilled = (current + new_tokens).min(cap);
            self.tokens.store(refilled, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_up_to_capacity() {
        let bucket = TokenBucket::new(10);
        for _ in 0..10 {
            assert!(bucket.try_take());
        }
        assert!(!bucket.try_take());
    }

    #[test]
    fn refills_over_time() {
        let bucket = TokenBucket::new(1000);
        while bucket.try_take() {}
        std::thread::sleep(Duration::from_millis(20));
        // ~20 tokens should have landed.
        assert!(bucket.try_take());
    }

    #[tokio::test]
    async fn acquire_waits_for_token() {
        let bucket = TokenBucket::new(200);
        while bucket.try_take() {}
        let start = Instant::now();
        bucket.acquire().await;
        // One token every 5ms at 200/s; allow generous slack.
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
