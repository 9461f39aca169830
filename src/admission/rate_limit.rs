//! Token-bucket rate limiter.
//!
//! The bucket holds at most `capacity` tokens (the burst) and refills
//! continuously at `refill_per_sec` (the sustained rate).  Each admission
//! takes one whole token.

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (fractional).
    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Refill to capacity.
    pub fn reset(&mut self, now: Instant) {
        self.tokens = self.capacity;
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn burst_then_empty() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(8, 4.0, t0);
        for _ in 0..8 {
            assert!(bucket.try_acquire(t0));
        }
        assert!(!bucket.try_acquire(t0));
    }

    #[test]
    fn refills_at_sustained_rate() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(8, 4.0, t0);
        while bucket.try_acquire(t0) {}

        assert!(!bucket.try_acquire(t0 + Duration::from_millis(200)));
        assert!(bucket.try_acquire(t0 + Duration::from_millis(250)));
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(8, 4.0, t0);
        let later = t0 + Duration::from_secs(60);
        assert!((bucket.available(later) - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn over_rate_traffic_is_limited_to_burst_plus_refill() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(8, 4.0, t0);
        // 10 req/s for 10 s.
        let allowed = (0..100)
            .filter(|i| bucket.try_acquire(t0 + Duration::from_millis(i * 100)))
            .count();
        // 8 burst + ~4/s * 9.9 s of refill.
        assert!((46..=48).contains(&allowed), "allowed {allowed}");
    }

    #[test]
    fn at_rate_traffic_is_never_limited() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(8, 4.0, t0);
        let allowed = (0..40)
            .filter(|i| bucket.try_acquire(t0 + Duration::from_millis(i * 250)))
            .count();
        assert_eq!(allowed, 40);
    }
}
