use std::thread;
use std::time::{Duration, Instant};

/// Paces a polling loop at a fixed frequency.
///
/// Deadlines are derived from the start instant rather than the previous
/// wake, so a slow iteration is not compounded into all later ones.
pub struct RateLimiter {
    interval: Duration,
    next: Instant,
}

impl RateLimiter {
    /// A rate at or below ~0.001 Hz disables pacing entirely.
    pub fn new(rate_hz: f64) -> Self {
        let interval = if rate_hz > 0.001 {
            Duration::from_secs_f64(1.0 / rate_hz)
        } else {
            Duration::ZERO
        };

        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Sleep until the next deadline if the loop is running ahead of the
    /// configured rate; otherwise return immediately.
    pub fn maybe_sleep(&mut self) {
        if self.interval.is_zero() {
            return;
        }

        self.next += self.interval;

        let now = Instant::now();
        if self.next > now {
            thread::sleep(self.next - now);
        } else {
            // fell behind; re-anchor instead of bursting to catch up
            self.next = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paces_at_configured_rate() {
        let mut limiter = RateLimiter::new(100.0);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.maybe_sleep();
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(80), "too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "too slow: {elapsed:?}");
    }

    #[test]
    fn zero_rate_never_sleeps() {
        let mut limiter = RateLimiter::new(0.0);
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.maybe_sleep();
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
