//! Token-bucket rate limiting for step dispatch.

use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

use crate::error::{OpsctlError, Result};

/// Token bucket capping steps-per-second across a block.
///
/// Tokens are whole: each acquire takes exactly one, and refill mints whole
/// tokens as time passes, carrying the sub-token remainder on the refill
/// clock. Capacity equals the refill rate, so at most one second of burst is
/// possible; a fractional rate rounds capacity up (a 2.5/s limiter can burst
/// three). Safe for concurrent acquirers: the bucket lock is only held while
/// bookkeeping, never across a sleep.
#[derive(Debug)]
pub struct RateLimiter {
    /// Tokens minted per second.
    rate: f64,
    capacity: u64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    /// Mint time of the last whole token; sub-token credit lives in the
    /// distance between this and now.
    minted_at: Instant,
}

impl RateLimiter {
    /// Create a limiter refilling at `rate_per_second` tokens per second.
    ///
    /// The bucket starts full.
    pub fn new(rate_per_second: f64) -> Self {
        let rate = rate_per_second.max(f64::MIN_POSITIVE);
        let capacity = (rate.ceil() as u64).max(1);
        Self {
            rate,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                minted_at: Instant::now(),
            }),
        }
    }

    /// Block until a token is available or the deadline expires.
    pub async fn acquire(&self, deadline: Option<Instant>) -> Result<()> {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.minted_at).as_secs_f64();
                let minted = (elapsed * self.rate) as u64;

                if minted > 0 {
                    bucket.tokens = (bucket.tokens + minted).min(self.capacity);
                    if bucket.tokens == self.capacity {
                        // full bucket: surplus credit is discarded
                        bucket.minted_at = now;
                    } else {
                        bucket.minted_at += Duration::from_secs_f64(minted as f64 / self.rate);
                    }
                }

                if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    return Ok(());
                }

                // time until the next whole token mints; the floor keeps a
                // float-rounding shortfall from turning into a busy loop
                let outstanding = now.duration_since(bucket.minted_at).as_secs_f64();
                Duration::from_secs_f64((1.0 / self.rate - outstanding).max(0.001))
            };

            if let Some(deadline) = deadline {
                if Instant::now() + wait > deadline {
                    return Err(OpsctlError::Timeout {
                        operation: "rate limit acquisition".to_string(),
                        seconds: wait.as_secs(),
                    });
                }
            }
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_capacity_is_immediate() {
        let limiter = RateLimiter::new(5.0);

        let before = Instant::now();
        for _ in 0..5 {
            limiter.acquire(None).await.unwrap();
        }
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn fractional_rate_rounds_capacity_up() {
        let limiter = RateLimiter::new(2.5);

        let before = Instant::now();
        for _ in 0..3 {
            limiter.acquire(None).await.unwrap();
        }
        assert_eq!(Instant::now(), before);

        // the bucket is empty now; the next token mints at 2.5/s
        limiter.acquire(None).await.unwrap();
        let waited = Instant::now() - before;
        assert!(waited >= Duration::from_millis(350), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(500), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_for_refill() {
        let limiter = RateLimiter::new(2.0);

        limiter.acquire(None).await.unwrap();
        limiter.acquire(None).await.unwrap();

        let before = Instant::now();
        limiter.acquire(None).await.unwrap();
        let waited = Instant::now() - before;

        // one token refills in 500ms at 2/s
        assert!(waited >= Duration::from_millis(450), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(600), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_fails_past_deadline() {
        let limiter = RateLimiter::new(1.0);
        limiter.acquire(None).await.unwrap();

        let deadline = Instant::now() + Duration::from_millis(100);
        let result = limiter.acquire(Some(deadline)).await;

        assert!(matches!(result, Err(OpsctlError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_succeeds_when_deadline_allows_refill() {
        let limiter = RateLimiter::new(1.0);
        limiter.acquire(None).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        limiter.acquire(Some(deadline)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquirers_are_paced() {
        let limiter = Arc::new(RateLimiter::new(1.0));

        let before = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(None).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // first token is free, the other two refill at 1/s
        let elapsed = Instant::now() - before;
        assert!(elapsed >= Duration::from_millis(1900), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn sub_unit_rates_still_grant_tokens() {
        let limiter = RateLimiter::new(0.5);
        limiter.acquire(None).await.unwrap();

        let before = Instant::now();
        limiter.acquire(None).await.unwrap();
        let waited = Instant::now() - before;

        // at 0.5/s the next token takes ~2s
        assert!(waited >= Duration::from_millis(1900), "waited {waited:?}");
    }
}
