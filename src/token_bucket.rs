use std::time::Duration;
use tokio::time::Instant;

/// Token bucket with continuous linear refill.
///
/// Tokens are fractional so refill follows real elapsed time rather than ticks.
/// `0 <= tokens <= capacity` holds after every operation.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::new_at(capacity, refill_rate, Instant::now())
    }

    pub fn new_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_rate,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    pub fn consume(&mut self, n: u32) -> bool {
        self.consume_at(n, Instant::now())
    }

    /// Refills up to `now`, then takes `n` tokens if they are all available.
    /// A refused request leaves the token count untouched.
    pub fn consume_at(&mut self, n: u32, now: Instant) -> bool {
        self.refill(now);
        let n = n as f64;
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 && self.refill_rate > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        }
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Minimum wait before `n` tokens are available, assuming nobody else consumes.
    pub fn wait_time(&self, n: u32) -> Duration {
        let n = n as f64;
        if self.tokens >= n {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64((n - self.tokens) / self.refill_rate).unwrap_or(Duration::MAX)
    }
}
