//! Rate limiting — token bucket over an events-per-interval ceiling.
//!
//! Used for originate/forward message rates on the router, per-peer receive
//! ceilings on channels, and packet rates on the datagram transport. Each
//! event costs one token; an empty bucket means the event is dropped or
//! deferred, never queued here.

use std::time::{Duration, Instant};

use vigil_core::config::RateLimitConfig;

#[derive(Debug)]
pub struct RateLimiter {
    tokens: f64,
    capacity: f64,
    /// Tokens per second. Infinite for an unlimited limiter.
    refill_rate: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Allow `events` per `interval`, with bursts up to `events`.
    pub fn new(events: u32, interval: Duration) -> Self {
        let capacity = f64::from(events.max(1));
        let refill_rate = capacity / interval.as_secs_f64().max(f64::MIN_POSITIVE);
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    pub fn from_config(cfg: RateLimitConfig) -> Self {
        Self::new(cfg.events, cfg.interval())
    }

    /// A limiter that never refuses.
    pub fn unlimited() -> Self {
        Self {
            tokens: f64::INFINITY,
            capacity: f64::INFINITY,
            refill_rate: f64::INFINITY,
            last_refill: Instant::now(),
        }
    }

    /// Returns true if the event may proceed, consuming one token.
    pub fn allow(&mut self) -> bool {
        if self.capacity.is_infinite() {
            return true;
        }

        // Refill based on elapsed time
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens.min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_always_allows() {
        let mut limiter = RateLimiter::unlimited();
        for _ in 0..1000 {
            assert!(limiter.allow());
        }
    }

    #[test]
    fn burst_depletes_then_refuses() {
        let mut limiter = RateLimiter::new(10, Duration::from_secs(60));
        let mut allowed = 0;
        for _ in 0..100 {
            if limiter.allow() {
                allowed += 1;
            }
        }
        // 10 burst tokens, negligible refill over the loop
        assert!(allowed >= 10);
        assert!(allowed < 14);
    }

    #[test]
    fn refills_over_time() {
        let mut limiter = RateLimiter::new(1000, Duration::from_millis(100));
        while limiter.allow() {}
        std::thread::sleep(Duration::from_millis(50));
        assert!(limiter.allow(), "tokens should refill with elapsed time");
    }

    #[test]
    fn from_config_matches_direct_construction() {
        let cfg = RateLimitConfig {
            events: 5,
            interval_ms: 1_000,
        };
        let mut limiter = RateLimiter::from_config(cfg);
        let mut allowed = 0;
        for _ in 0..20 {
            if limiter.allow() {
                allowed += 1;
            }
        }
        assert!((5..8).contains(&allowed));
    }
}
