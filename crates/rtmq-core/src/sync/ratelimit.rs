//! Windowed rate limiter for log messages on hot paths

use std::time::{Duration, Instant};

/// Default window: at most 10 messages every 5 seconds
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_BURST: u32 = 10;

/// Allows `burst` events per `interval`; the rest are counted and reported
/// when the next window opens
#[derive(Debug, Clone)]
pub struct RateLimit {
    interval: Duration,
    burst: u32,
    window_start: Option<Instant>,
    n_printed: u32,
    n_missed: u32,
}

impl RateLimit {
    pub fn new(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst,
            window_start: None,
            n_printed: 0,
            n_missed: 0,
        }
    }

    /// Returns `true` if the caller may log now
    pub fn check(&mut self) -> bool {
        self.check_at(Instant::now())
    }

    fn check_at(&mut self, now: Instant) -> bool {
        let expired = match self.window_start {
            None => true,
            Some(start) => now.duration_since(start) > self.interval,
        };

        if expired {
            if self.n_missed > 0 {
                log::warn!("{} events suppressed", self.n_missed);
            }
            self.window_start = Some(now);
            self.n_printed = 0;
            self.n_missed = 0;
        }

        if self.n_printed < self.burst {
            self.n_printed += 1;
            return true;
        }

        self.n_missed += 1;
        false
    }

    /// Events dropped in the current window
    pub fn suppressed(&self) -> u32 {
        self.n_missed
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, DEFAULT_BURST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_suppress() {
        let mut limit = RateLimit::new(Duration::from_secs(5), 3);
        let now = Instant::now();

        assert!(limit.check_at(now));
        assert!(limit.check_at(now));
        assert!(limit.check_at(now));
        assert!(!limit.check_at(now));
        assert!(!limit.check_at(now));
        assert_eq!(limit.suppressed(), 2);
    }

    #[test]
    fn test_window_reopens() {
        let mut limit = RateLimit::new(Duration::from_millis(100), 1);
        let now = Instant::now();

        assert!(limit.check_at(now));
        assert!(!limit.check_at(now + Duration::from_millis(50)));
        assert!(limit.check_at(now + Duration::from_millis(150)));
        assert_eq!(limit.suppressed(), 0);
    }
}
