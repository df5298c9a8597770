//! Token bucket limiting inbound webhook requests.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

/// Holds up to `max_tokens`; one token comes back per `refill_interval`.
///
/// Refill is lazy: each [`allow`](RateLimiter::allow) credits the whole
/// intervals elapsed since the last refill before taking a token.
pub struct RateLimiter {
    max_tokens: u32,
    refill_interval: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Starts full.
    pub fn new(max_tokens: u32, refill_interval: Duration) -> Self {
        Self {
            max_tokens,
            refill_interval,
            bucket: Mutex::new(Bucket {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn available(&self) -> u32 {
        self.bucket.lock().tokens
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, now);

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            return true;
        }

        warn!(
            tokens_remaining = bucket.tokens,
            max_tokens = self.max_tokens,
            "Rate limit exceeded"
        );
        false
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if self.refill_interval.is_zero() {
            bucket.tokens = self.max_tokens;
            bucket.last_refill = now;
            return;
        }
        if elapsed < self.refill_interval {
            return;
        }

        let intervals = elapsed.as_nanos() / self.refill_interval.as_nanos();
        let added = u32::try_from(intervals).unwrap_or(u32::MAX);
        bucket.tokens = bucket.tokens.saturating_add(added).min(self.max_tokens);
        bucket.last_refill = if bucket.tokens == self.max_tokens {
            now
        } else {
            // keep the partial interval so slow trickles still refill
            bucket.last_refill + self.refill_interval * added
        };
    }
}
